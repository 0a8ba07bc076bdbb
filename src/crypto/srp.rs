//! SRP-6a over the RFC 5054 3072-bit group with SHA-512, as required by
//! HomeKit pair-setup. Both roles are implemented: the controller (client)
//! side used against real speakers, and the accessory (server) side used by
//! the mock speaker and the agreement tests.

use num_bigint::{BigUint, RandomBits};
use num_traits::Zero;
use rand::Rng;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use super::{CryptoError, lengths};

const N_3072_HEX: &[u8] =
    b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08\
      8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B\
      302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9\
      A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6\
      49286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8\
      FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D\
      670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C\
      180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
      3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D\
      04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7D\
      B3970F85A6E1E4C7ABF5AE8CDB0933D71E8C94E04A25619DCEE3D226\
      1AD2EE6BF12FFA06D98A0864D87602733EC86A64521F2B18177B200C\
      BBE117577A615D6C770988C0BAD946E208E24FA074E5AB3143DB5BFC\
      E0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

struct Group {
    n: BigUint,
    g: BigUint,
    k: BigUint,
}

impl Group {
    fn rfc5054_3072() -> Result<Self, CryptoError> {
        let n = BigUint::parse_bytes(N_3072_HEX, 16)
            .ok_or_else(|| CryptoError::SrpError("failed to parse group modulus".to_string()))?;
        let g = BigUint::from(5u32);

        // k = H(N, pad(g))
        let k = {
            let mut hasher = Sha512::new();
            hasher.update(n.to_bytes_be());
            hasher.update(pad(&g.to_bytes_be()));
            BigUint::from_bytes_be(&hasher.finalize())
        };

        Ok(Self { n, g, k })
    }
}

/// Left-pad a big-endian value to the group size. Values already at or over
/// the group size pass through unchanged.
fn pad(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() >= lengths::SRP_PUBLIC_KEY {
        return bytes.to_vec();
    }
    let mut padded = vec![0u8; lengths::SRP_PUBLIC_KEY];
    padded[lengths::SRP_PUBLIC_KEY - bytes.len()..].copy_from_slice(bytes);
    padded
}

// x = H(salt, H(username ":" password))
fn compute_x(username: &[u8], password: &[u8], salt: &[u8]) -> BigUint {
    let mut inner = Sha512::new();
    inner.update(username);
    inner.update(b":");
    inner.update(password);
    let h_up = inner.finalize();

    let mut outer = Sha512::new();
    outer.update(salt);
    outer.update(h_up);
    BigUint::from_bytes_be(&outer.finalize())
}

// u = H(pad(A), pad(B))
fn compute_u(a_pub: &BigUint, b_pub: &BigUint) -> BigUint {
    let mut hasher = Sha512::new();
    hasher.update(pad(&a_pub.to_bytes_be()));
    hasher.update(pad(&b_pub.to_bytes_be()));
    BigUint::from_bytes_be(&hasher.finalize())
}

// M1 = H(H(N) xor H(g), H(username), salt, pad(A), B, K)
fn compute_m1(
    group: &Group,
    username: &[u8],
    salt: &[u8],
    a_pub: &BigUint,
    b_pub: &BigUint,
    k_session: &[u8],
) -> Vec<u8> {
    let hn = Sha512::digest(group.n.to_bytes_be());
    let hg = Sha512::digest(group.g.to_bytes_be());
    let mut hn_xor_hg = [0u8; 64];
    for i in 0..64 {
        hn_xor_hg[i] = hn[i] ^ hg[i];
    }

    let mut hasher = Sha512::new();
    hasher.update(hn_xor_hg);
    hasher.update(Sha512::digest(username));
    hasher.update(salt);
    hasher.update(pad(&a_pub.to_bytes_be()));
    hasher.update(b_pub.to_bytes_be());
    hasher.update(k_session);
    hasher.finalize().to_vec()
}

// M2 = H(A, M1, K)
fn compute_m2(a_pub: &BigUint, m1: &[u8], k_session: &[u8]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(a_pub.to_bytes_be());
    hasher.update(m1);
    hasher.update(k_session);
    hasher.finalize().to_vec()
}

/// Controller side of the SRP exchange
pub struct SrpClient {
    group: Group,
    a: BigUint,
    public_key: Vec<u8>,
}

impl SrpClient {
    pub fn new() -> Result<Self, CryptoError> {
        let group = Group::rfc5054_3072()?;

        let mut rng = rand::thread_rng();
        let a: BigUint = rng.sample(RandomBits::new(256));
        let a = a % &group.n;

        let a_pub = group.g.modpow(&a, &group.n);
        let public_key = pad(&a_pub.to_bytes_be());

        Ok(Self {
            group,
            a,
            public_key,
        })
    }

    /// Our public value A, padded to the group size
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Consume the server challenge (salt, B) and produce the proof state
    pub fn process_challenge(
        &self,
        username: &[u8],
        password: &[u8],
        salt: &[u8],
        server_public: &[u8],
    ) -> Result<SrpVerifier, CryptoError> {
        let b_pub = BigUint::from_bytes_be(server_public);
        if (&b_pub % &self.group.n).is_zero() {
            return Err(CryptoError::SrpError("invalid server public key".to_string()));
        }

        let a_pub = BigUint::from_bytes_be(&self.public_key);
        let u = compute_u(&a_pub, &b_pub);
        let x = compute_x(username, password, salt);

        // S = (B - k * g^x) ^ (a + u * x) mod N, with the subtraction kept
        // non-negative by adding N when needed
        let g_x = self.group.g.modpow(&x, &self.group.n);
        let k_g_x = (&self.group.k * g_x) % &self.group.n;
        let base = if b_pub >= k_g_x {
            (&b_pub - &k_g_x) % &self.group.n
        } else {
            (&self.group.n - (&k_g_x - &b_pub) % &self.group.n) % &self.group.n
        };
        let exp = &self.a + (&u * x);
        let s_shared = base.modpow(&exp, &self.group.n);

        let k_session = Sha512::digest(s_shared.to_bytes_be()).to_vec();
        let m1 = compute_m1(&self.group, username, salt, &a_pub, &b_pub, &k_session);

        Ok(SrpVerifier {
            a_pub,
            m1,
            k_session,
        })
    }
}

/// Client proof state between M3 and M4
pub struct SrpVerifier {
    a_pub: BigUint,
    m1: Vec<u8>,
    k_session: Vec<u8>,
}

impl SrpVerifier {
    /// Our proof M1, sent to the server
    pub fn client_proof(&self) -> &[u8] {
        &self.m1
    }

    /// Check the server proof M2 and release the 64-byte session key
    pub fn verify_server(self, server_proof: &[u8]) -> Result<SessionKey, CryptoError> {
        let expected_m2 = compute_m2(&self.a_pub, &self.m1, &self.k_session);
        if expected_m2 != server_proof {
            return Err(CryptoError::SrpError(
                "server proof verification failed".to_string(),
            ));
        }

        Ok(SessionKey {
            key: self.k_session,
        })
    }
}

/// Accessory side of the SRP exchange
pub struct SrpServer {
    group: Group,
    username: Vec<u8>,
    salt: Vec<u8>,
    verifier: BigUint,
    b: BigUint,
    public_key: Vec<u8>,
}

impl SrpServer {
    /// Build the accessory state from the credentials. The salt is normally
    /// 16 random bytes; it is a parameter so tests can be deterministic.
    pub fn new(username: &[u8], password: &[u8], salt: &[u8]) -> Result<Self, CryptoError> {
        let group = Group::rfc5054_3072()?;

        let x = compute_x(username, password, salt);
        let verifier = group.g.modpow(&x, &group.n);

        let mut rng = rand::thread_rng();
        let b: BigUint = rng.sample(RandomBits::new(256));
        let b = b % &group.n;

        // B = k*v + g^b mod N
        let b_pub = (&group.k * &verifier + group.g.modpow(&b, &group.n)) % &group.n;
        let public_key = pad(&b_pub.to_bytes_be());

        Ok(Self {
            group,
            username: username.to_vec(),
            salt: salt.to_vec(),
            verifier,
            b,
            public_key,
        })
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Our public value B, padded to the group size
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Check the client proof M1 against (A, M1); on success returns our
    /// proof M2 and the session key
    pub fn verify_client(
        &self,
        client_public: &[u8],
        client_proof: &[u8],
    ) -> Result<(Vec<u8>, SessionKey), CryptoError> {
        let a_pub = BigUint::from_bytes_be(client_public);
        if (&a_pub % &self.group.n).is_zero() {
            return Err(CryptoError::SrpError("invalid client public key".to_string()));
        }

        let b_pub = BigUint::from_bytes_be(&self.public_key);
        let u = compute_u(&a_pub, &b_pub);

        // S = (A * v^u) ^ b mod N
        let v_u = self.verifier.modpow(&u, &self.group.n);
        let base = (&a_pub * v_u) % &self.group.n;
        let s_shared = base.modpow(&self.b, &self.group.n);

        let k_session = Sha512::digest(s_shared.to_bytes_be()).to_vec();
        let expected_m1 = compute_m1(
            &self.group,
            &self.username,
            &self.salt,
            &a_pub,
            &b_pub,
            &k_session,
        );

        if expected_m1 != client_proof {
            return Err(CryptoError::SrpError(
                "client proof verification failed".to_string(),
            ));
        }

        let m2 = compute_m2(&a_pub, client_proof, &k_session);

        Ok((m2, SessionKey { key: k_session }))
    }
}

/// The negotiated session key K = H(S); zeroed on drop
pub struct SessionKey {
    key: Vec<u8>,
}

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
