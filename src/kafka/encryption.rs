//! Message encryption
//!
//! Consumers decrypt every message before handling it and producers encrypt
//! every message before submitting it. What "encrypt" means is up to the
//! handler: it may transform the value, the headers or both.

use crate::models::Message;

pub trait EncryptionHandler: Send + Sync {
    fn decrypt(&self, message: &mut Message) -> anyhow::Result<()>;
    fn encrypt(&self, message: &mut Message) -> anyhow::Result<()>;
}

/// Leaves messages untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEncryption;

impl EncryptionHandler for NoEncryption {
    fn decrypt(&self, _message: &mut Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn encrypt(&self, _message: &mut Message) -> anyhow::Result<()> {
        Ok(())
    }
}
