use geohop::identity::{Keypair, KeypairError, NodeId, PublicKey, SecretKey, Signature, Signer};

/// Test: Each generated keypair should be unique
#[test]
fn test_keypairs_are_unique() {
    let keypair1 = Keypair::generate();
    let keypair2 = Keypair::generate();

    assert_ne!(
        keypair1.public_key().as_bytes(),
        keypair2.public_key().as_bytes(),
        "Two generated keypairs should have different public keys"
    );
}

/// Test: Can serialize keypair to bytes and restore it
#[test]
fn test_keypair_serialization() {
    let original = Keypair::generate();
    let bytes = original.to_bytes();
    assert_eq!(bytes.len(), 32);

    let restored = Keypair::from_bytes(&bytes).expect("Should deserialize keypair from bytes");
    assert_eq!(original.public_key(), restored.public_key());
}

/// Test: Public key survives a byte round trip
#[test]
fn test_public_key_from_bytes() {
    let public_key = Keypair::generate().public_key();
    let restored = PublicKey::from_bytes(public_key.as_bytes()).unwrap();
    assert_eq!(public_key, restored);
}

/// Test: Wrong-length input is rejected with the lengths involved
#[test]
fn test_invalid_key_lengths_fail() {
    assert!(matches!(
        Keypair::from_bytes(&[0u8; 16]),
        Err(KeypairError::InvalidLength { expected: 32, got: 16 })
    ));
    assert!(matches!(
        PublicKey::from_bytes(&[0u8; 31]),
        Err(KeypairError::InvalidLength { expected: 32, got: 31 })
    ));
}

/// Test: Can rebuild a keypair from its secret half
#[test]
fn test_keypair_from_secret_key() {
    let original = Keypair::generate();
    let secret = SecretKey::from_bytes(&original.secret_key().to_bytes()).unwrap();
    let rebuilt = Keypair::from_secret_key(secret);
    assert_eq!(original.public_key(), rebuilt.public_key());
}

/// Test: The 24-word backup phrase restores the same identity
#[test]
fn test_mnemonic_backup_restores_identity() {
    let original = Keypair::generate();
    let phrase = original.to_mnemonic().unwrap();
    assert_eq!(phrase.split_whitespace().count(), 24);

    // Extra whitespace and capitals are tolerated
    let messy = format!("  {}  ", phrase.to_uppercase().replace(' ', "   "));
    let restored = Keypair::from_mnemonic(&messy).unwrap();
    assert_eq!(original.public_key(), restored.public_key());
}

/// Test: A phrase with a bad checksum word is refused
#[test]
fn test_invalid_mnemonic_fails() {
    let result = Keypair::from_mnemonic("abandon abandon abandon");
    assert!(matches!(result, Err(KeypairError::InvalidMnemonic(_))));
}

/// Test: Node ids derive from the public key and print as base58
#[test]
fn test_node_id_derivation() {
    let keypair = Keypair::generate();
    let id = NodeId::from_public_key(&keypair.public_key());

    assert_eq!(id, NodeId::from_public_key(&keypair.public_key()));
    assert_ne!(id.as_bytes(), keypair.public_key().as_bytes());

    let parsed: NodeId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
    assert!(id.short().starts_with('!'));
    assert!("not-base58-0OIl".parse::<NodeId>().is_err());
    assert!(bs58::encode([1u8; 8]).into_string().parse::<NodeId>().is_err());
}

/// Test: Signatures verify only for the signing key and message
#[test]
fn test_signatures_bind_key_and_message() {
    let signer = Keypair::generate();
    let other = Keypair::generate();
    let signature = Signer::sign(&signer, b"10 HOP to bob");

    assert!(Signer::verify(&signer.public_key(), b"10 HOP to bob", &signature));
    assert!(!Signer::verify(&other.public_key(), b"10 HOP to bob", &signature));
    assert!(!Signer::verify(&signer.public_key(), b"99 HOP to bob", &signature));

    let restored = Signature::from_bytes(signature.as_bytes()).unwrap();
    assert_eq!(restored, signature);
    assert!(Signature::from_bytes(&[0u8; 10]).is_err());
}
