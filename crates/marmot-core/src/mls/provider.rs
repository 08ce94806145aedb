//! OpenMLS provider wired to the engine's Environment.
//!
//! OpenMLS expects a `&Provider` on every operation. This provider uses
//! synchronous RustCrypto primitives and in-memory storage, and routes all
//! randomness through the [`Environment`] trait so MLS key generation is
//! seeded in simulation and OS-backed in production.

use openmls_memory_storage::MemoryStorage;
use openmls_rust_crypto::RustCrypto;
use openmls_traits::{random::OpenMlsRand, OpenMlsProvider};

use crate::env::Environment;

/// Provider handed to every OpenMLS call.
pub struct MlsProvider<E: Environment> {
    crypto: RustCrypto,
    rand: EnvRng<E>,
    storage: MemoryStorage,
}

impl<E: Environment> MlsProvider<E> {
    /// Create a provider drawing randomness from `env`.
    pub fn new(env: E) -> Self {
        Self {
            crypto: RustCrypto::default(),
            rand: EnvRng { env },
            storage: MemoryStorage::default(),
        }
    }
}

/// RNG adapter delegating to the Environment.
pub struct EnvRng<E: Environment> {
    env: E,
}

impl<E: Environment> rand::RngCore for EnvRng<E> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.env.random_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        self.env.random_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.env.random_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.env.random_bytes(dest);
        Ok(())
    }
}

impl<E: Environment> rand::CryptoRng for EnvRng<E> {}

impl<E: Environment> OpenMlsRand for EnvRng<E> {
    type Error = std::convert::Infallible;

    fn random_array<const N: usize>(&self) -> Result<[u8; N], Self::Error> {
        let mut bytes = [0u8; N];
        self.env.random_bytes(&mut bytes);
        Ok(bytes)
    }

    fn random_vec(&self, len: usize) -> Result<Vec<u8>, Self::Error> {
        let mut bytes = vec![0u8; len];
        self.env.random_bytes(&mut bytes);
        Ok(bytes)
    }
}

impl<E: Environment> OpenMlsProvider for MlsProvider<E> {
    type CryptoProvider = RustCrypto;
    type RandProvider = EnvRng<E>;
    type StorageProvider = MemoryStorage;

    fn crypto(&self) -> &Self::CryptoProvider {
        &self.crypto
    }

    fn rand(&self) -> &Self::RandProvider {
        &self.rand
    }

    fn storage(&self) -> &Self::StorageProvider {
        &self.storage
    }
}
