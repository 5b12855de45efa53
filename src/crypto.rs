use ark_bn254::G1Affine;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::{AffinePoint, EncodedPoint, NonZeroScalar, ProjectivePoint, Scalar, SecretKey, U256};
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};

use crate::errors::{PosError, PosResult};
use crate::params::{BN_PK_LEN, SEC_PK_LEN};
use crate::types::Address;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Interprets a 32-byte digest as a scalar, reducing modulo the curve order.
pub fn scalar_from_bytes(bytes: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&(*bytes).into())
}

pub fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_bytes().into()
}

pub fn random_scalar() -> Scalar {
    *NonZeroScalar::random(&mut OsRng).as_ref()
}

pub fn secret_scalar(secret: &SecretKey) -> Scalar {
    *secret.to_nonzero_scalar().as_ref()
}

/// Parses a 65-byte uncompressed secp256k1 public key.
pub fn decode_sec_pubkey(bytes: &[u8]) -> PosResult<ProjectivePoint> {
    if bytes.len() != SEC_PK_LEN {
        return Err(PosError::Crypto(format!(
            "secp256k1 key must be {SEC_PK_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let encoded = EncodedPoint::from_bytes(bytes)
        .map_err(|err| PosError::Crypto(format!("malformed secp256k1 key: {err}")))?;
    let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
    let affine = affine.ok_or_else(|| PosError::Crypto("point is not on secp256k1".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Serializes a point to the 65-byte uncompressed wire form.
pub fn encode_sec_pubkey(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(false).as_bytes().to_vec()
}

pub fn local_public_key_bytes(secret: &SecretKey) -> Vec<u8> {
    encode_sec_pubkey(&(ProjectivePoint::GENERATOR * secret_scalar(secret)))
}

/// Derives the account address of an uncompressed secp256k1 key.
pub fn address_from_sec_pubkey(pk: &[u8]) -> PosResult<Address> {
    if pk.len() != SEC_PK_LEN || pk[0] != 0x04 {
        return Err(PosError::Crypto("address requires an uncompressed key".into()));
    }
    let digest = keccak256(&pk[1..]);
    Ok(hex::encode(&digest[12..]))
}

/// Parses a 64-byte uncompressed BN254 G1 public key.
pub fn decode_bn_pubkey(bytes: &[u8]) -> PosResult<G1Affine> {
    if bytes.len() != BN_PK_LEN {
        return Err(PosError::Crypto(format!(
            "bn254 key must be {BN_PK_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    G1Affine::deserialize_uncompressed(bytes)
        .map_err(|err| PosError::Crypto(format!("malformed bn254 key: {err}")))
}

pub fn encode_bn_pubkey(point: &G1Affine) -> PosResult<Vec<u8>> {
    let mut out = Vec::with_capacity(BN_PK_LEN);
    point
        .serialize_uncompressed(&mut out)
        .map_err(|err| PosError::Crypto(format!("bn254 serialization failed: {err}")))?;
    Ok(out)
}

/// Chaum-Pedersen proof that one scalar links every `(base, image)` pair:
/// `image[j] = alpha * base[j]` for all `j`.
///
/// The stage-2 payload carries it as the `(e, z)` integer pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DleqProof {
    pub e: Scalar,
    pub z: Scalar,
}

impl DleqProof {
    pub fn generate(alpha: &Scalar, bases: &[ProjectivePoint], images: &[ProjectivePoint]) -> Self {
        let w = random_scalar();
        let commitments: Vec<ProjectivePoint> = bases.iter().map(|base| base * &w).collect();
        let e = challenge(bases, images, &commitments);
        let z = w - e * alpha;
        Self { e, z }
    }

    pub fn verify(&self, bases: &[ProjectivePoint], images: &[ProjectivePoint]) -> bool {
        if bases.is_empty() || bases.len() != images.len() {
            return false;
        }
        let commitments: Vec<ProjectivePoint> = bases
            .iter()
            .zip(images)
            .map(|(base, image)| base * &self.z + image * &self.e)
            .collect();
        challenge(bases, images, &commitments) == self.e
    }
}

fn challenge(
    bases: &[ProjectivePoint],
    images: &[ProjectivePoint],
    commitments: &[ProjectivePoint],
) -> Scalar {
    let mut hasher = Keccak256::new();
    for point in bases.iter().chain(images).chain(commitments) {
        hasher.update(encode_sec_pubkey(point));
    }
    let digest: [u8; 32] = hasher.finalize().into();
    scalar_from_bytes(&digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (Scalar, ProjectivePoint) {
        let secret = random_scalar();
        (secret, ProjectivePoint::GENERATOR * secret)
    }

    #[test]
    fn sec_pubkey_round_trip() {
        let (_, point) = keypair();
        let bytes = encode_sec_pubkey(&point);
        assert_eq!(bytes.len(), SEC_PK_LEN);
        assert_eq!(bytes[0], 0x04);
        let decoded = decode_sec_pubkey(&bytes).expect("decode");
        assert_eq!(encode_sec_pubkey(&decoded), bytes);
    }

    #[test]
    fn sec_pubkey_rejects_off_curve_bytes() {
        let mut bytes = vec![0x04];
        bytes.extend_from_slice(&[0x55; 64]);
        assert!(decode_sec_pubkey(&bytes).is_err());
        assert!(decode_sec_pubkey(&bytes[..64]).is_err());
    }

    #[test]
    fn bn_pubkey_round_trip() {
        use ark_bn254::{Fr, G1Projective};
        use ark_ec::{AffineRepr, CurveGroup};

        let point = (G1Projective::from(G1Affine::generator()) * Fr::from(7u64)).into_affine();
        let bytes = encode_bn_pubkey(&point).expect("encode");
        assert_eq!(bytes.len(), BN_PK_LEN);
        let decoded = decode_bn_pubkey(&bytes).expect("decode");
        assert_eq!(decoded, point);
    }

    #[test]
    fn address_matches_trailing_keccak_bytes() {
        let (_, point) = keypair();
        let pk = encode_sec_pubkey(&point);
        let address = address_from_sec_pubkey(&pk).expect("address");
        assert_eq!(address.len(), 40);
        let digest = keccak256(&pk[1..]);
        assert_eq!(address, hex::encode(&digest[12..]));
    }

    #[test]
    fn dleq_proof_verifies_for_matching_scalar() {
        let alpha = random_scalar();
        let bases: Vec<ProjectivePoint> = (0..5).map(|_| keypair().1).collect();
        let images: Vec<ProjectivePoint> = bases.iter().map(|base| base * &alpha).collect();
        let proof = DleqProof::generate(&alpha, &bases, &images);
        assert!(proof.verify(&bases, &images));
    }

    #[test]
    fn dleq_proof_rejects_tampered_image() {
        let alpha = random_scalar();
        let bases: Vec<ProjectivePoint> = (0..5).map(|_| keypair().1).collect();
        let mut images: Vec<ProjectivePoint> = bases.iter().map(|base| base * &alpha).collect();
        let proof = DleqProof::generate(&alpha, &bases, &images);
        images[2] = images[2] + ProjectivePoint::GENERATOR;
        assert!(!proof.verify(&bases, &images));
    }

    #[test]
    fn dleq_proof_rejects_foreign_scalar() {
        let alpha = random_scalar();
        let beta = random_scalar();
        let bases: Vec<ProjectivePoint> = (0..3).map(|_| keypair().1).collect();
        let images: Vec<ProjectivePoint> = bases.iter().map(|base| base * &beta).collect();
        let proof = DleqProof::generate(&alpha, &bases, &images);
        assert!(!proof.verify(&bases, &images));
    }
}
