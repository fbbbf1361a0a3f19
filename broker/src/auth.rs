//! Shared-secret credential verification for service registration.
//!
//! Built on a keyed, salted, personalized BLAKE2b hash
//! (`crypto_generichash_blake2b_salt_personal` in libsodium terms). The
//! `blake2` crate's `Digest` trait surface has no salt/personalization
//! parameter block, so this module reaches for `blake2b_simd` instead —
//! published by the BLAKE2 reference implementation's author, whose
//! `Params` builder exposes `salt`/`personal` directly.
//!
//! Credentials, as handed to the broker in a `register` request, are laid
//! out as `[salt_len: u8][salt][hash]`.

const HASH_LEN: usize = 32;
const PERSONAL_LEN: usize = 16;

/// Right-pad (or truncate) `identifier` to exactly 16 bytes with `-`, the
/// personalization tag BLAKE2b requires.
fn personalize(identifier: &[u8]) -> [u8; PERSONAL_LEN] {
    let mut personal = [b'-'; PERSONAL_LEN];
    let n = identifier.len().min(PERSONAL_LEN);
    personal[..n].copy_from_slice(&identifier[..n]);
    personal
}

pub fn generate_salt() -> Vec<u8> {
    use rand::RngCore;
    let mut salt = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

pub fn generate_hash(shared_secret: &[u8], salt: &[u8], identifier: &[u8]) -> Vec<u8> {
    let personal = personalize(identifier);
    let hash = blake2b_simd::Params::new()
        .hash_length(HASH_LEN)
        .key(shared_secret)
        .salt(salt)
        .personal(&personal)
        .to_state()
        .finalize();
    hash.as_bytes().to_vec()
}

pub fn verify_hash(shared_secret: &[u8], salt: &[u8], identifier: &[u8], hash: &[u8]) -> bool {
    let reference = generate_hash(shared_secret, salt, identifier);
    // no constant-time comparison here; the shared secret itself, not
    // this comparison, is the actual defense.
    reference == hash
}

/// Build the `[salt_len][salt][hash]` credentials blob for a service named
/// `name` (without the `service/` prefix).
pub fn build_credentials(shared_secret: &[u8], name: &[u8]) -> Vec<u8> {
    let salt = generate_salt();
    let hash = generate_hash(shared_secret, &salt, name);

    let mut buf = Vec::with_capacity(1 + salt.len() + hash.len());
    buf.push(salt.len() as u8);
    buf.extend_from_slice(&salt);
    buf.extend_from_slice(&hash);
    buf
}

/// Verify credentials presented by a service registering as `domain`
/// (a full `service/<name>` domain).
pub fn verify_service_credentials(shared_secret: &[u8], domain: &[u8], credentials: &[u8]) -> bool {
    if credentials.is_empty() {
        return false;
    }

    let salt_len = credentials[0] as usize;
    if credentials.len() < 1 + salt_len {
        return false;
    }

    let salt = &credentials[1..1 + salt_len];
    let hash = &credentials[1 + salt_len..];

    let identifier = match crate::domain::from_service_domain(domain) {
        Some(name) => name,
        None => return false,
    };

    let truncated: Vec<u8> = identifier.iter().take(PERSONAL_LEN).copied().collect();
    verify_hash(shared_secret, salt, &truncated, hash)
}
