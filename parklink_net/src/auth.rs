// Server side of the challenge/response handshake.
//
// A connecting client asks for a token; the server answers with a fresh
// random challenge and remembers it on the connection. The client signs the
// challenge with its private key and sends back its protocol version, name,
// password, public key and signature. `resolve_verdict` turns that reply
// into an `AuthStatus`.
//
// Checks run in a fixed order and the first failure decides the verdict:
//
//   1. protocol version          -> BadVersion
//   2. non-empty name            -> BadName
//   3. password, unless the key's group may log in without one
//                                -> RequirePassword (none given) / BadPassword
//   4. population limit          -> Full
//   5. signature over challenge  -> VerificationFailure
//   6. key known, if required    -> UnknownKeyDisallowed
//
// Every verdict other than `Ok` ends the connection once the reply has been
// sent, except `RequirePassword`, after which the client may try again.

use parklink_protocol::{AuthStatus, Permission, PROTOCOL_VERSION};

use crate::keys::PublicKey;
use crate::roster::Roster;

const MIN_CHALLENGE_LEN: usize = 10;

/// Random challenge of 10 to 137 bytes.
pub fn generate_challenge() -> Vec<u8> {
    let len = MIN_CHALLENGE_LEN + usize::from(rand::random::<u8>() & 0x7f);
    (0..len).map(|_| rand::random::<u8>()).collect()
}

/// The credentials a client sent in its AUTH packet.
#[derive(Clone, Copy, Debug)]
pub struct AuthAttempt<'a> {
    pub version: &'a str,
    pub name: &'a str,
    pub password: &'a str,
    /// Hex-encoded public key.
    pub public_key: &'a str,
    pub signature: &'a [u8],
}

/// Server-side admission rules.
#[derive(Clone, Copy, Debug)]
pub struct AdmissionPolicy<'a> {
    /// Empty means the server has no password.
    pub password: &'a str,
    pub max_players: u32,
    /// Players currently in the session, host included.
    pub players: u32,
    pub known_keys_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub status: AuthStatus,
    /// Hash of the client's public key, when the key could be parsed.
    pub key_hash: Option<String>,
}

pub fn resolve_verdict(
    attempt: &AuthAttempt<'_>,
    challenge: &[u8],
    policy: &AdmissionPolicy<'_>,
    roster: &Roster,
) -> Verdict {
    let key = PublicKey::from_hex(attempt.public_key).ok();
    let key_hash = key.map(|k| k.hash());
    let verdict = |status| Verdict {
        status,
        key_hash: key_hash.clone(),
    };

    if attempt.version != PROTOCOL_VERSION {
        return verdict(AuthStatus::BadVersion);
    }
    if attempt.name.trim().is_empty() {
        return verdict(AuthStatus::BadName);
    }

    let group = match &key_hash {
        Some(hash) => roster.group_for_key(hash),
        None => roster.groups.default_group(),
    };
    let passwordless = roster
        .groups
        .get(group)
        .is_some_and(|g| g.can_perform(Permission::PasswordlessLogin));
    if !passwordless && !policy.password.is_empty() {
        if attempt.password.is_empty() {
            return verdict(AuthStatus::RequirePassword);
        }
        if attempt.password != policy.password {
            return verdict(AuthStatus::BadPassword);
        }
    }

    if policy.players >= policy.max_players {
        return verdict(AuthStatus::Full);
    }

    let verified = key.is_some_and(|k| !challenge.is_empty() && k.verify(challenge, attempt.signature));
    if !verified {
        return verdict(AuthStatus::VerificationFailure);
    }
    let known = key_hash.as_deref().is_some_and(|h| roster.users.get(h).is_some());
    if policy.known_keys_only && !known {
        return verdict(AuthStatus::UnknownKeyDisallowed);
    }
    verdict(AuthStatus::Ok)
}
