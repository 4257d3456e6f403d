//! AES-128-CCM AEAD primitives used by [`crate::session::MatterSession`].
//!
//! Trimmed from the teacher's `util/cryptoutil.rs`: the HKDF/HMAC/PEM/ASN.1
//! helpers it also carried belonged to PASE/CASE session establishment, which
//! is out of scope here (§1) — only the symmetric encrypt/decrypt this core's
//! reference `Session` needs once keys already exist survives.

use aes::cipher::crypto_common;
use anyhow::Result;

pub type Aes128Ccm = ccm::Ccm<aes::Aes128, ccm::consts::U16, ccm::consts::U13>;

pub fn aes128_ccm_encrypt(
    key: &crypto_common::Key<Aes128Ccm>,
    nonce: &[u8],
    aad: &[u8],
    msg: &[u8],
) -> Result<Vec<u8>> {
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    match ccm::aead::Aead::encrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    ) {
        Ok(o) => Ok(o),
        Err(e) => Err(anyhow::anyhow!("encrypt error {:?}", e)),
    }
}

pub fn aes128_ccm_decrypt(
    key: &crypto_common::Key<Aes128Ccm>,
    nonce: &[u8],
    aad: &[u8],
    msg: &[u8],
) -> Result<Vec<u8>> {
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    match ccm::aead::Aead::decrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    ) {
        Ok(o) => Ok(o),
        Err(e) => Err(anyhow::anyhow!(format!("decrypt error {:?}", e))),
    }
}
