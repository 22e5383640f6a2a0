//! SPAKE2+ over P-256 (RFC 9383 flavor).
//!
//! The prover (commissioner) holds the witnesses `w0`/`w1` stretched from
//! the setup passcode; the verifier (device) holds only `w0` and the point
//! `L = w1·G`, installed out of band. Neither the passcode nor the verifier
//! material ever crosses the wire, and neither side installs keys until both
//! confirmation tags verified.

use elliptic_curve::bigint::U256;
use elliptic_curve::group::Group;
use elliptic_curve::ops::Reduce;
use elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use elliptic_curve::{Field, PrimeField};
use once_cell::sync::Lazy;
use p256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::{hkdf_sha256, hmac_sha256, pbkdf2_sha256, sha256};
use crate::error::Error;
use crate::message::P256_POINT_LEN;

/// Domain separation string mixed into the transcript.
const CONTEXT: &[u8] = b"selink SPAKE2+-P256-SHA256-HKDF-HMAC";

/// Standard SPAKE2+ blinding point M for P-256.
static M: Lazy<ProjectivePoint> = Lazy::new(|| {
    decode_point(&M_BYTES).expect("valid point constant")
});

/// Standard SPAKE2+ blinding point N for P-256.
static N: Lazy<ProjectivePoint> = Lazy::new(|| {
    decode_point(&N_BYTES).expect("valid point constant")
});

#[rustfmt::skip]
const M_BYTES: [u8; P256_POINT_LEN] = [
    0x04,
    0x88, 0x6e, 0x2f, 0x97, 0xac, 0xe4, 0x6e, 0x55, 0xba, 0x9d, 0xd7, 0x24, 0x25, 0x79, 0xf2, 0x99,
    0x3b, 0x64, 0xe1, 0x6e, 0xf3, 0xdc, 0xab, 0x95, 0xaf, 0xd4, 0x97, 0x33, 0x3d, 0x8f, 0xa1, 0x2f,
    0x5f, 0xf3, 0x55, 0x16, 0x3e, 0x43, 0xce, 0x22, 0x4e, 0x0b, 0x0e, 0x65, 0xff, 0x02, 0xac, 0x8e,
    0x5c, 0x7b, 0xe0, 0x94, 0x19, 0xc7, 0x85, 0xe0, 0xca, 0x54, 0x7d, 0x55, 0xa1, 0x2e, 0x2d, 0x20,
];

#[rustfmt::skip]
const N_BYTES: [u8; P256_POINT_LEN] = [
    0x04,
    0xd8, 0xbb, 0xd6, 0xc6, 0x39, 0xc6, 0x29, 0x37, 0xb0, 0x4d, 0x99, 0x7f, 0x38, 0xc3, 0x77, 0x07,
    0x19, 0xc6, 0x29, 0xd7, 0x01, 0x4d, 0x49, 0xa2, 0x4b, 0x4f, 0x98, 0xba, 0xa1, 0x29, 0x2b, 0x49,
    0x07, 0xd6, 0x0a, 0xa6, 0xbf, 0xad, 0xe4, 0x50, 0x08, 0xa6, 0x36, 0x33, 0x7f, 0x51, 0x68, 0xc6,
    0x4d, 0x9b, 0xd3, 0x60, 0x34, 0x80, 0x8c, 0xd5, 0x64, 0x49, 0x0b, 0x1e, 0x65, 0x6e, 0xdb, 0xe7,
];

fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint, Error> {
    let encoded =
        EncodedPoint::from_bytes(bytes).map_err(|_| Error::AuthenticationFailed)?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or(Error::AuthenticationFailed)?;
    let point = ProjectivePoint::from(affine);
    if bool::from(point.is_identity()) {
        return Err(Error::AuthenticationFailed);
    }
    Ok(point)
}

fn encode_point(point: &ProjectivePoint) -> [u8; P256_POINT_LEN] {
    let encoded = point.to_affine().to_encoded_point(false);
    let mut out = [0u8; P256_POINT_LEN];
    out.copy_from_slice(encoded.as_bytes());
    out
}

fn reduce_scalar(bytes: &[u8]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(bytes))
}

/// Stretch a passcode into the (w0, w1) witness pair.
fn compute_witnesses(password: &[u8], salt: &[u8], iterations: u32) -> (Scalar, Scalar) {
    let mut okm = [0u8; 64];
    pbkdf2_sha256(password, salt, iterations, &mut okm);
    let w0 = reduce_scalar(&okm[..32]);
    let w1 = reduce_scalar(&okm[32..]);
    okm.zeroize();
    (w0, w1)
}

/// The shared secret both sides derive once confirmation succeeds.
pub struct PakeSecret(pub(crate) [u8; 32]);

impl PakeSecret {
    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for PakeSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for PakeSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PakeSecret")
    }
}

struct TranscriptKeys {
    kca: [u8; 32],
    kcb: [u8; 32],
    ke: [u8; 32],
}

fn push_len(tt: &mut Vec<u8>, data: &[u8]) {
    tt.extend_from_slice(&(data.len() as u64).to_le_bytes());
    tt.extend_from_slice(data);
}

fn derive_keys(
    pa: &[u8; P256_POINT_LEN],
    pb: &[u8; P256_POINT_LEN],
    z: &ProjectivePoint,
    v: &ProjectivePoint,
    w0: &Scalar,
) -> Result<TranscriptKeys, Error> {
    let mut tt = Vec::with_capacity(512);
    push_len(&mut tt, CONTEXT);
    push_len(&mut tt, b""); // prover identity
    push_len(&mut tt, b""); // verifier identity
    push_len(&mut tt, &M_BYTES);
    push_len(&mut tt, &N_BYTES);
    push_len(&mut tt, pa);
    push_len(&mut tt, pb);
    push_len(&mut tt, &encode_point(z));
    push_len(&mut tt, &encode_point(v));
    push_len(&mut tt, &w0.to_bytes());

    let k_main = sha256(&tt);
    tt.zeroize();

    let mut confirm = [0u8; 64];
    hkdf_sha256(&k_main, &[], b"ConfirmationKeys", &mut confirm)?;

    let mut ke = [0u8; 32];
    hkdf_sha256(&k_main, &[], b"SharedKey", &mut ke)?;

    let mut kca = [0u8; 32];
    let mut kcb = [0u8; 32];
    kca.copy_from_slice(&confirm[..32]);
    kcb.copy_from_slice(&confirm[32..]);
    confirm.zeroize();

    Ok(TranscriptKeys { kca, kcb, ke })
}

/// Prover side key material (commissioner).
#[derive(Clone)]
pub struct Spake2pProver {
    w0: Scalar,
    w1: Scalar,
}

impl Spake2pProver {
    /// Stretch a raw passcode. The commissioner side is allowed to see the
    /// passcode; the device side is not.
    pub fn from_password(password: &[u8], salt: &[u8], iterations: u32) -> Self {
        let (w0, w1) = compute_witnesses(password, salt, iterations);
        Spake2pProver { w0, w1 }
    }

    /// Produce the ephemeral share pA and the state to finish the exchange.
    pub fn start(self) -> (ProverState, [u8; P256_POINT_LEN]) {
        let x = Scalar::random(&mut OsRng);
        let share = ProjectivePoint::GENERATOR * x + *M * self.w0;
        let pa = encode_point(&share);
        (
            ProverState {
                x,
                pa,
                w0: self.w0,
                w1: self.w1,
            },
            pa,
        )
    }
}

/// In-flight prover exchange.
pub struct ProverState {
    x: Scalar,
    pa: [u8; P256_POINT_LEN],
    w0: Scalar,
    w1: Scalar,
}

impl ProverState {
    /// Process the verifier share and confirmation tag.
    ///
    /// Returns our confirmation tag cA and the shared secret. A bad share or
    /// tag aborts with a generic authentication failure; no key material is
    /// returned on any partial result.
    pub fn finish(
        self,
        pb: &[u8; P256_POINT_LEN],
        cb: &[u8; 32],
    ) -> Result<([u8; 32], PakeSecret), Error> {
        let pb_point = decode_point(pb)?;

        let base = pb_point - *N * self.w0;
        if bool::from(base.is_identity()) {
            return Err(Error::AuthenticationFailed);
        }

        let z = base * self.x;
        let v = base * self.w1;

        let keys = derive_keys(&self.pa, pb, &z, &v, &self.w0)?;

        let expected_cb = hmac_sha256(&keys.kcb, &self.pa);
        if !bool::from(expected_cb.ct_eq(cb)) {
            return Err(Error::AuthenticationFailed);
        }

        let ca = hmac_sha256(&keys.kca, pb);
        Ok((ca, PakeSecret(keys.ke)))
    }
}

/// Verifier side key material (device). This is what commissioning installs
/// out of band; it cannot be used to impersonate the prover.
#[derive(Clone)]
pub struct Spake2pVerifier {
    w0: Scalar,
    l: ProjectivePoint,
}

impl Spake2pVerifier {
    /// Compute the verifier from a raw passcode. Meant for the provisioning
    /// tool that generates the out-of-band record, not for the device.
    pub fn from_password(password: &[u8], salt: &[u8], iterations: u32) -> Self {
        let (w0, w1) = compute_witnesses(password, salt, iterations);
        Spake2pVerifier {
            w0,
            l: ProjectivePoint::GENERATOR * w1,
        }
    }

    /// Reassemble a verifier from its stored parts.
    pub fn from_parts(w0: &[u8; 32], l: &[u8; P256_POINT_LEN]) -> Result<Self, Error> {
        let w0 = Option::<Scalar>::from(Scalar::from_repr(*FieldBytes::from_slice(w0)))
            .ok_or(Error::Crypto("invalid w0"))?;
        let l = decode_point(l).map_err(|_| Error::Crypto("invalid L"))?;
        Ok(Spake2pVerifier { w0, l })
    }

    /// Serialize for out-of-band installation.
    pub fn to_parts(&self) -> ([u8; 32], [u8; P256_POINT_LEN]) {
        (self.w0.to_bytes().into(), encode_point(&self.l))
    }

    /// Process the prover share pA, producing our share pB, the confirmation
    /// tag cB and the state that awaits the prover's cA.
    pub fn respond(
        &self,
        pa: &[u8; P256_POINT_LEN],
    ) -> Result<(VerifierState, [u8; P256_POINT_LEN], [u8; 32]), Error> {
        let pa_point = decode_point(pa)?;

        let y = Scalar::random(&mut OsRng);
        let pb_point = ProjectivePoint::GENERATOR * y + *N * self.w0;
        let pb = encode_point(&pb_point);

        let base = pa_point - *M * self.w0;
        if bool::from(base.is_identity()) {
            return Err(Error::AuthenticationFailed);
        }

        let z = base * y;
        let v = self.l * y;

        let keys = derive_keys(pa, &pb, &z, &v, &self.w0)?;

        let cb = hmac_sha256(&keys.kcb, pa);
        let expected_ca = hmac_sha256(&keys.kca, &pb);

        Ok((
            VerifierState {
                expected_ca,
                ke: keys.ke,
            },
            pb,
            cb,
        ))
    }
}

/// In-flight verifier exchange, waiting for the prover confirmation.
pub struct VerifierState {
    expected_ca: [u8; 32],
    ke: [u8; 32],
}

impl VerifierState {
    /// Check the prover's confirmation tag. Only a verified tag releases the
    /// shared secret.
    pub fn confirm(self, ca: &[u8; 32]) -> Result<PakeSecret, Error> {
        if !bool::from(self.expected_ca.ct_eq(ca)) {
            return Err(Error::AuthenticationFailed);
        }
        Ok(PakeSecret(self.ke))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8] = b"SPAKE2P Key Salt";

    #[test]
    fn matching_password_agrees_on_secret() {
        let prover = Spake2pProver::from_password(b"20202021", SALT, 100);
        let verifier = Spake2pVerifier::from_password(b"20202021", SALT, 100);

        let (prover, pa) = prover.start();
        let (vstate, pb, cb) = verifier.respond(&pa).unwrap();
        let (ca, prover_secret) = prover.finish(&pb, &cb).unwrap();
        let verifier_secret = vstate.confirm(&ca).unwrap();

        assert_eq!(prover_secret.bytes(), verifier_secret.bytes());
    }

    #[test]
    fn wrong_password_fails_both_directions() {
        let prover = Spake2pProver::from_password(b"20202021", SALT, 100);
        let verifier = Spake2pVerifier::from_password(b"99999998", SALT, 100);

        let (prover, pa) = prover.start();
        let (_vstate, pb, cb) = verifier.respond(&pa).unwrap();

        // The prover rejects the verifier's confirmation tag.
        assert_eq!(
            prover.finish(&pb, &cb).unwrap_err(),
            Error::AuthenticationFailed
        );
    }

    #[test]
    fn forged_confirmation_rejected() {
        let prover = Spake2pProver::from_password(b"1234", SALT, 10);
        let verifier = Spake2pVerifier::from_password(b"1234", SALT, 10);

        let (prover, pa) = prover.start();
        let (vstate, pb, cb) = verifier.respond(&pa).unwrap();
        let (mut ca, _secret) = prover.finish(&pb, &cb).unwrap();

        ca[0] ^= 1;
        assert_eq!(vstate.confirm(&ca).unwrap_err(), Error::AuthenticationFailed);
    }

    #[test]
    fn verifier_parts_roundtrip() {
        let verifier = Spake2pVerifier::from_password(b"1234", SALT, 10);
        let (w0, l) = verifier.to_parts();
        let restored = Spake2pVerifier::from_parts(&w0, &l).unwrap();

        let prover = Spake2pProver::from_password(b"1234", SALT, 10);
        let (prover, pa) = prover.start();
        let (vstate, pb, cb) = restored.respond(&pa).unwrap();
        let (ca, s1) = prover.finish(&pb, &cb).unwrap();
        let s2 = vstate.confirm(&ca).unwrap();
        assert_eq!(s1.bytes(), s2.bytes());
    }

    #[test]
    fn invalid_share_rejected() {
        let verifier = Spake2pVerifier::from_password(b"1234", SALT, 10);
        let garbage = [0x42u8; P256_POINT_LEN];
        assert!(verifier.respond(&garbage).is_err());
    }
}
