// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software implementations of the crypto traits, for parts without the
//! accelerators.

use drv_sboot_api::{
    BootError, CryptoHashEngine, EcdsaPublicKey, EcdsaSignature, Sha256Digest,
    SignatureVerifier,
};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};

#[derive(Default)]
pub struct Sha2Engine {
    hasher: Option<Sha256>,
}

impl CryptoHashEngine for Sha2Engine {
    // Matches the accelerator so the same layouts validate either way.
    const WORD_SIZE: usize = 4;

    fn start(&mut self) -> Result<(), BootError> {
        self.hasher = Some(Sha256::new());
        Ok(())
    }

    fn feed(&mut self, data: &[u8]) -> Result<(), BootError> {
        self.hasher
            .as_mut()
            .ok_or(BootError::ParameterInvalid)?
            .update(data);
        Ok(())
    }

    fn finish(&mut self) -> nb::Result<Sha256Digest, BootError> {
        let h = self
            .hasher
            .take()
            .ok_or(nb::Error::Other(BootError::ParameterInvalid))?;
        Ok(h.finalize().into())
    }
}

/// ECDSA over P-256, checked against a precomputed SHA-256 digest.
#[derive(Default)]
pub struct P256Verifier;

impl SignatureVerifier for P256Verifier {
    fn verify(
        &mut self,
        digest: &Sha256Digest,
        signature: &EcdsaSignature,
        key: &EcdsaPublicKey,
    ) -> Result<bool, BootError> {
        let key = p256::EncodedPoint::from_bytes(key.to_sec1_uncompressed())
            .map_err(|_| BootError::ParameterInvalid)?;
        let key = VerifyingKey::from_encoded_point(&key)
            .map_err(|_| BootError::ParameterInvalid)?;

        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&signature.r);
        rs[32..].copy_from_slice(&signature.s);
        // Out-of-range scalars are a bad signature, not a bad call.
        let Ok(sig) = Signature::from_slice(&rs) else {
            return Ok(false);
        };

        Ok(key.verify_prehash(digest, &sig).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::SigningKey;

    /// Public key for the private scalar 1: the curve generator.
    const KEY_ONE: EcdsaPublicKey = EcdsaPublicKey {
        x: [
            0x6b, 0x17, 0xd1, 0xf2, 0xe1, 0x2c, 0x42, 0x47, 0xf8, 0xbc, 0xe6,
            0xe5, 0x63, 0xa4, 0x40, 0xf2, 0x77, 0x03, 0x7d, 0x81, 0x2d, 0xeb,
            0x33, 0xa0, 0xf4, 0xa1, 0x39, 0x45, 0xd8, 0x98, 0xc2, 0x96,
        ],
        y: [
            0x4f, 0xe3, 0x42, 0xe2, 0xfe, 0x1a, 0x7f, 0x9b, 0x8e, 0xe7, 0xeb,
            0x4a, 0x7c, 0x0f, 0x9e, 0x16, 0x2b, 0xce, 0x33, 0x57, 0x6b, 0x31,
            0x5e, 0xce, 0xcb, 0xb6, 0x40, 0x68, 0x37, 0xbf, 0x51, 0xf5,
        ],
    };

    fn sign(digest: &Sha256Digest) -> EcdsaSignature {
        let mut one = [0u8; 32];
        one[31] = 1;
        let key = SigningKey::from_slice(&one).unwrap();
        let sig: Signature = key.sign_prehash(digest).unwrap();
        let (r, s) = sig.split_bytes();
        EcdsaSignature {
            r: r.as_slice().try_into().unwrap(),
            s: s.as_slice().try_into().unwrap(),
        }
    }

    #[test]
    fn accepts_good_rejects_bad() {
        let digest: Sha256Digest = Sha256::digest(b"image").into();
        let sig = sign(&digest);
        let mut v = P256Verifier;
        assert_eq!(v.verify(&digest, &sig, &KEY_ONE), Ok(true));

        let mut other = digest;
        other[0] ^= 1;
        assert_eq!(v.verify(&other, &sig, &KEY_ONE), Ok(false));

        let zero = EcdsaSignature {
            r: [0; 32],
            s: [0; 32],
        };
        assert_eq!(v.verify(&digest, &zero, &KEY_ONE), Ok(false));
    }

    #[test]
    fn off_curve_key_is_a_parameter_error() {
        let digest = [0u8; 32];
        let bad = EcdsaPublicKey {
            x: [1; 32],
            y: [2; 32],
        };
        assert_eq!(
            P256Verifier.verify(&digest, &sign(&digest), &bad),
            Err(BootError::ParameterInvalid)
        );
    }

    #[test]
    fn sha2_engine_finishes_at_once() {
        let mut e = Sha2Engine::default();
        e.start().unwrap();
        e.feed(b"ab").unwrap();
        e.feed(b"c").unwrap();
        let want: Sha256Digest = Sha256::digest(b"abc").into();
        assert_eq!(e.finish().ok(), Some(want));
        assert!(matches!(
            e.finish(),
            Err(nb::Error::Other(BootError::ParameterInvalid))
        ));
    }
}
