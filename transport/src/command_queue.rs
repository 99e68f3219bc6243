use crate::executor::{CommandExecutor, Schedulable, ScheduleState};
use crate::packet_decoder::ReassembledCommand;
use crate::packet_header::Lane;
#[cfg(test)] use mockall::automock;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace};

/// The application's entry point for commands of one connection. Calls for a given connection
///  never overlap, and they happen in the order in which the commands were enqueued.
#[cfg_attr(test, automock)]
pub trait CommandHandler: Send + Sync {
    /// Returns `false` if the connection should not process any further commands, which discards
    ///  all commands that are still pending.
    fn handle_command(&self, command: ReassembledCommand) -> bool;
}

struct PendingCommands {
    commands: VecDeque<ReassembledCommand>,
    /// true while a worker is draining the queue or the queue waits for a worker
    handling_scheduled: bool,
}

/// The pending commands of a single connection, together with the handler that processes them.
///  This is the unit that is scheduled on the [CommandExecutor].
pub struct CommandHandling {
    pending: Mutex<PendingCommands>,
    handler: Arc<dyn CommandHandler>,
    schedule_state: ScheduleState,
}

impl CommandHandling {
    pub fn new(handler: Arc<dyn CommandHandler>) -> CommandHandling {
        CommandHandling {
            pending: Mutex::new(PendingCommands {
                commands: VecDeque::new(),
                handling_scheduled: false,
            }),
            handler,
            schedule_state: ScheduleState::default(),
        }
    }

    /// Appends the command and returns `true` if handling was scheduled already. If it was not,
    ///  the caller is responsible for submitting this handling to the executor.
    pub fn enqueue(&self, command: ReassembledCommand) -> bool {
        let mut pending = self.pending.lock();
        pending.commands.push_back(command);
        std::mem::replace(&mut pending.handling_scheduled, true)
    }

    pub fn reset(&self) {
        let dropped = {
            let mut pending = self.pending.lock();
            pending.handling_scheduled = false;
            std::mem::take(&mut pending.commands)
        };
        if !dropped.is_empty() {
            trace!("discarding {} pending commands", dropped.len());
        }
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().commands.len()
    }

    pub fn is_scheduled(&self) -> bool {
        self.pending.lock().handling_scheduled
    }

    fn pop_command(&self) -> (Option<ReassembledCommand>, bool) {
        let mut pending = self.pending.lock();
        match pending.commands.pop_front() {
            None => {
                pending.handling_scheduled = false;
                (None, false)
            }
            // NB: even if this was the last command, more can arrive while it is being handled,
            //  so we report 'more pending' and find out on the next round
            Some(command) => (Some(command), true),
        }
    }
}

impl Schedulable for CommandHandling {
    /// Handles exactly one command
    fn execute_handling(&self) -> bool {
        let (command, more_pending) = self.pop_command();
        let command = match command {
            Some(command) => command,
            None => return false,
        };

        match catch_unwind(AssertUnwindSafe(|| self.handler.handle_command(command))) {
            Ok(true) => more_pending,
            Ok(false) => {
                self.reset();
                false
            }
            Err(_) => {
                error!("panic reached command execution root");
                more_pending
            }
        }
    }

    fn schedule_state(&self) -> &ScheduleState {
        &self.schedule_state
    }
}

/// A connection's command queue: enqueued commands are handled on the shared executor, strictly
///  one at a time and in order.
pub struct CommandQueue {
    executor: Arc<CommandExecutor>,
    handling: Arc<CommandHandling>,
}

impl CommandQueue {
    pub fn new(executor: Arc<CommandExecutor>, handler: Arc<dyn CommandHandler>) -> CommandQueue {
        CommandQueue {
            executor,
            handling: Arc::new(CommandHandling::new(handler)),
        }
    }

    pub fn enqueue_command(&self, command: ReassembledCommand) {
        if !self.handling.enqueue(command) {
            self.executor.enqueue_handler(self.handling.clone());
        }
    }

    /// Injects a command that did not arrive over the wire, e.g. a command generated by the
    ///  server on the client's behalf
    pub fn enqueue_command_string(&self, command: &str) {
        self.enqueue_command(ReassembledCommand::new(Lane::Normal, Bytes::copy_from_slice(command.as_bytes())));
    }

    pub fn num_pending(&self) -> usize {
        self.handling.num_pending()
    }

    pub fn reset(&self) {
        self.handling.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    fn command(text: &str) -> ReassembledCommand {
        ReassembledCommand::new(Lane::Normal, Bytes::copy_from_slice(text.as_bytes()))
    }

    fn recording_handler(result: bool) -> (MockCommandHandler, Arc<Mutex<Vec<String>>>) {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let mut handler = MockCommandHandler::new();
        let cloned = handled.clone();
        handler.expect_handle_command()
            .returning(move |cmd| {
                cloned.lock().push(String::from_utf8(cmd.command().to_vec()).unwrap());
                result
            });
        (handler, handled)
    }

    #[test]
    fn test_enqueue_reports_scheduled() {
        let handling = CommandHandling::new(Arc::new(MockCommandHandler::new()));
        assert!(!handling.is_scheduled());
        assert!(!handling.enqueue(command("a")));
        assert!(handling.enqueue(command("b")));
        assert!(handling.is_scheduled());
        assert_eq!(handling.num_pending(), 2);
    }

    #[test]
    fn test_execute_handling_one_at_a_time() {
        let (handler, handled) = recording_handler(true);
        let handling = CommandHandling::new(Arc::new(handler));
        handling.enqueue(command("a"));
        handling.enqueue(command("b"));

        assert!(handling.execute_handling());
        assert_eq!(*handled.lock(), vec!["a"]);
        assert!(handling.execute_handling());
        assert_eq!(*handled.lock(), vec!["a", "b"]);

        // the queue is drained, but this is only detected on the next round
        assert!(handling.is_scheduled());
        assert!(!handling.execute_handling());
        assert!(!handling.is_scheduled());

        assert!(!handling.enqueue(command("c")));
    }

    #[test]
    fn test_handler_veto_flushes_queue() {
        let (handler, handled) = recording_handler(false);
        let handling = CommandHandling::new(Arc::new(handler));
        for text in ["a", "b", "c"] {
            handling.enqueue(command(text));
        }

        assert!(!handling.execute_handling());
        assert_eq!(*handled.lock(), vec!["a"]);
        assert_eq!(handling.num_pending(), 0);
        assert!(!handling.is_scheduled());
    }

    #[test]
    fn test_handler_panic_does_not_stop_handling() {
        struct PanickingHandler;
        impl CommandHandler for PanickingHandler {
            fn handle_command(&self, _command: ReassembledCommand) -> bool {
                panic!("boom")
            }
        }

        let handling = CommandHandling::new(Arc::new(PanickingHandler));
        handling.enqueue(command("a"));
        handling.enqueue(command("b"));

        assert!(handling.execute_handling());
        assert_eq!(handling.num_pending(), 1);
    }

    /// records commands and fails the test if it is ever entered concurrently
    struct ExclusiveHandler {
        in_handler: AtomicBool,
        handled: Mutex<Vec<(usize, usize)>>,
        overlaps: Mutex<usize>,
    }

    impl CommandHandler for ExclusiveHandler {
        fn handle_command(&self, command: ReassembledCommand) -> bool {
            if self.in_handler.swap(true, Ordering::SeqCst) {
                *self.overlaps.lock() += 1;
            }
            std::thread::sleep(Duration::from_micros(50));

            let text = String::from_utf8(command.command().to_vec()).unwrap();
            let (producer, seq) = text.split_once(':').unwrap();
            self.handled.lock().push((producer.parse().unwrap(), seq.parse().unwrap()));

            self.in_handler.store(false, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_single_flight_with_concurrent_producers() {
        const PRODUCERS: usize = 4;
        const COMMANDS: usize = 200;

        let executor = Arc::new(CommandExecutor::new(4).unwrap());
        let handler = Arc::new(ExclusiveHandler {
            in_handler: AtomicBool::new(false),
            handled: Mutex::new(Vec::new()),
            overlaps: Mutex::new(0),
        });
        let queue = Arc::new(CommandQueue::new(executor.clone(), handler.clone()));

        let producers = (0..PRODUCERS)
            .map(|producer| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for seq in 0..COMMANDS {
                        queue.enqueue_command_string(&format!("{}:{}", producer, seq));
                    }
                })
            })
            .collect::<Vec<_>>();
        for producer in producers {
            producer.join().unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(20);
        while handler.handled.lock().len() < PRODUCERS * COMMANDS {
            assert!(Instant::now() < deadline, "commands were not handled in time");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(*handler.overlaps.lock(), 0);
        let handled = handler.handled.lock();
        for producer in 0..PRODUCERS {
            let sequence = handled.iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, seq)| *seq)
                .collect::<Vec<_>>();
            assert_eq!(sequence, (0..COMMANDS).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_queue_reset() {
        let executor = Arc::new(CommandExecutor::new(1).unwrap());
        executor.shutdown();

        let queue = CommandQueue::new(executor, Arc::new(MockCommandHandler::new()));
        queue.enqueue_command_string("a");
        queue.enqueue_command_string("b");
        assert_eq!(queue.num_pending(), 2);

        queue.reset();
        assert_eq!(queue.num_pending(), 0);
    }
}
