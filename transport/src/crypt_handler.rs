use crate::error::CryptError;
use crate::packet_header::MAC_LEN;
use aead::consts::U8;
use aead::generic_array::GenericArray;
use aead::{AeadInPlace, KeyInit};
use aes::Aes128;
use eax::Eax;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, trace};

/// AES-128 in EAX mode with a truncated 8 byte tag, which is what goes into the packet's MAC field
type PacketCipher = Eax<Aes128, U8>;

pub type CryptKey = [u8; 16];
pub type CryptNonce = [u8; 16];

/// key and nonce for packets sent before the shared secret is established
pub const DEFAULT_KEY: CryptKey = *b"c:\\windows\\syste";
pub const DEFAULT_NONCE: CryptNonce = *b"m\\firewall32.cpl";
/// MAC of unencrypted packets before the shared secret is established
pub const DEFAULT_MAC: [u8; MAC_LEN] = *b"TS3INIT1";

pub const SEED_LEN: usize = 10;
pub const SERVER_SEED_LEN_NEW: usize = 54;

struct CachedKeyNonce {
    generation: u16,
    key: CryptKey,
    nonce: CryptNonce,
}

struct CryptState {
    initialized: bool,
    iv_struct: Vec<u8>,
    current_mac: [u8; MAC_LEN],
    /// keyed by (direction is client->server, packet type)
    key_cache: FxHashMap<(bool, u8), CachedKeyNonce>,
}

impl Default for CryptState {
    fn default() -> Self {
        CryptState {
            initialized: false,
            iv_struct: Vec::new(),
            current_mac: DEFAULT_MAC,
            key_cache: FxHashMap::default(),
        }
    }
}

/// Per-connection packet crypto. Keys are derived per packet from the packet type, id and
///  generation plus the shared 'iv struct' that is established during the crypto setup
///  handshake.
#[derive(Default)]
pub struct CryptHandler {
    state: Mutex<CryptState>,
}

impl CryptHandler {
    pub fn new() -> CryptHandler {
        Default::default()
    }

    pub fn reset(&self) {
        *self.state.lock() = CryptState::default();
    }

    pub fn encryption_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// the MAC written into unencrypted packets
    pub fn current_mac(&self) -> [u8; MAC_LEN] {
        self.state.lock().current_mac
    }

    /// legacy protocol: `iv = (alpha || beta) ^ sha1(shared_key)`
    pub fn setup_shared_secret(&self, alpha: &[u8], beta: &[u8], shared_key: &[u8]) -> Result<(), CryptError> {
        if alpha.len() != SEED_LEN || beta.len() != SEED_LEN {
            return Err(CryptError::InvalidSecret("legacy seeds must be 10 bytes each"));
        }

        let secret_hash = Sha1::digest(shared_key);
        let iv = alpha.iter()
            .chain(beta.iter())
            .zip(secret_hash.iter())
            .map(|(a, b)| a ^ b)
            .collect::<Vec<_>>();

        self.install_iv(iv);
        Ok(())
    }

    /// licensed protocol: `iv = sha512(shared_secret) ^ (alpha || beta)` with a 54 byte beta
    pub fn setup_shared_secret_new(&self, alpha: &[u8], beta: &[u8], shared_secret: &[u8]) -> Result<(), CryptError> {
        if alpha.len() != SEED_LEN || beta.len() != SERVER_SEED_LEN_NEW {
            return Err(CryptError::InvalidSecret("seeds must be 10 and 54 bytes"));
        }

        let secret_hash = Sha512::digest(shared_secret);
        let iv = secret_hash.iter()
            .zip(alpha.iter().chain(beta.iter()))
            .map(|(a, b)| a ^ b)
            .collect::<Vec<_>>();

        self.install_iv(iv);
        Ok(())
    }

    fn install_iv(&self, iv: Vec<u8>) {
        let mac_hash = Sha1::digest(&iv);

        let mut state = self.state.lock();
        state.current_mac.copy_from_slice(&mac_hash[..MAC_LEN]);
        state.iv_struct = iv;
        state.key_cache.clear();
        state.initialized = true;
        debug!("shared secret established ({} byte iv)", state.iv_struct.len());
    }

    pub fn generate_key_nonce(&self, to_server: bool, packet_type: u8, packet_id: u16, generation: u16) -> Result<(CryptKey, CryptNonce), CryptError> {
        if packet_type > 0x0F {
            return Err(CryptError::KeyGenerationFailed);
        }

        let (mut key, nonce) = {
            let mut state = self.state.lock();
            let state = &mut *state;
            if !state.initialized {
                return Err(CryptError::KeyGenerationFailed);
            }

            let cache_key = (to_server, packet_type);
            match state.key_cache.get(&cache_key) {
                Some(cached) if cached.generation == generation => (cached.key, cached.nonce),
                _ => {
                    let mut buf = Vec::with_capacity(6 + state.iv_struct.len());
                    buf.push(if to_server { 0x31 } else { 0x30 });
                    buf.push(packet_type & 0x0F);
                    buf.extend_from_slice(&(generation as u32).to_be_bytes());
                    buf.extend_from_slice(&state.iv_struct);

                    let hash = Sha256::digest(&buf);
                    let mut key = CryptKey::default();
                    let mut nonce = CryptNonce::default();
                    key.copy_from_slice(&hash[..16]);
                    nonce.copy_from_slice(&hash[16..32]);

                    trace!("derived key for type {} generation {}", packet_type, generation);
                    state.key_cache.insert(cache_key, CachedKeyNonce { generation, key, nonce });
                    (key, nonce)
                }
            }
        };

        key[0] ^= (packet_id >> 8) as u8;
        key[1] ^= (packet_id & 0xFF) as u8;
        Ok((key, nonce))
    }

    /// encrypts `payload` in place, returning the MAC
    pub fn encrypt(&self, header: &[u8], payload: &mut [u8], key: &CryptKey, nonce: &CryptNonce) -> Result<[u8; MAC_LEN], CryptError> {
        let cipher = PacketCipher::new(GenericArray::from_slice(key));
        let tag = cipher.encrypt_in_place_detached(GenericArray::from_slice(nonce), header, payload)
            .map_err(|_| CryptError::EncryptFailed)?;

        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(tag.as_slice());
        Ok(mac)
    }

    /// decrypts `payload` in place after verifying `mac`. The payload is left untouched if
    ///  verification fails.
    pub fn decrypt(&self, header: &[u8], payload: &mut [u8], mac: &[u8], key: &CryptKey, nonce: &CryptNonce) -> Result<(), CryptError> {
        if mac.len() != MAC_LEN {
            return Err(CryptError::DecryptFailed);
        }

        let cipher = PacketCipher::new(GenericArray::from_slice(key));
        cipher.decrypt_in_place_detached(GenericArray::from_slice(nonce), header, payload, GenericArray::from_slice(mac))
            .map_err(|_| CryptError::DecryptFailed)
    }
}
