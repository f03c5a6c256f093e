use crate::db::DbFollow;
use crate::error::Error;
use nostr_types::{PublicKey, PublicKeyHex};

/// Normalize a pubkey given either as hex or as a bech32 `npub`.
/// The normalized form is lowercase hex32; anything else is rejected.
pub fn normalize_pubkey(input: &str) -> Result<String, Error> {
    let trimmed = input.trim();

    let pubkey = if trimmed.starts_with("npub") {
        PublicKey::try_from_bech32_string(trimmed, true)
            .map_err(|_| Error::InvalidPubkey(input.to_owned()))?
    } else {
        PublicKey::try_from_hex_string(&trimmed.to_lowercase(), true)
            .map_err(|_| Error::InvalidPubkey(input.to_owned()))?
    };

    Ok(pubkey.as_hex_string())
}

/// The union of manual follows and project keypairs, normalized,
/// deduplicated and sorted. Rebuilt from the store on demand; nothing
/// caches this across subscription refreshes.
pub async fn follow_set() -> Result<Vec<PublicKeyHex>, Error> {
    let mut hexes: Vec<String> = DbFollow::fetch(None)
        .await?
        .drain(..)
        .map(|f| f.pubkey)
        .collect();
    hexes.sort();
    hexes.dedup();

    let mut output: Vec<PublicKeyHex> = Vec::new();
    for hex in hexes.iter() {
        match PublicKeyHex::try_from_str(hex) {
            Ok(pkh) => output.push(pkh),
            Err(_) => tracing::warn!("Skipping non-normalizable follow entry: {}", hex),
        }
    }

    Ok(output)
}

#[cfg(test)]
mod test {
    use super::*;
    use bech32::{ToBase32, Variant};

    const PK_HEX: &str = "ee11a5dff40c19a555f41fe42b48f00e618c91225622ae37b6c2bb67b76c4e49";

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_pubkey(PK_HEX).unwrap();
        let twice = normalize_pubkey(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, PK_HEX);
    }

    #[test]
    fn test_normalize_uppercase_and_whitespace() {
        let input = format!("  {}  ", PK_HEX.to_uppercase());
        assert_eq!(normalize_pubkey(&input).unwrap(), PK_HEX);
    }

    #[test]
    fn test_npub_and_hex_agree() {
        let bytes = hex::decode(PK_HEX).unwrap();
        let npub = bech32::encode("npub", bytes.to_base32(), Variant::Bech32).unwrap();
        assert_eq!(normalize_pubkey(&npub).unwrap(), PK_HEX);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(normalize_pubkey("not a key").is_err());
        assert!(normalize_pubkey("abcd").is_err());
        assert!(normalize_pubkey("").is_err());
    }
}
