//! Property tests for key validation and derivation.

use keyroot::material::{validate_material, MAX_PASSPHRASE_LEN, MIN_PASSPHRASE_LEN};
use keyroot::{derive_wrapping_key, pbkdf2_hmac_sha1, ErrorKind, KeyFormat};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn passphrase_derivation_is_deterministic(
        passphrase in proptest::collection::vec(
            any::<u8>(),
            MIN_PASSPHRASE_LEN..=MAX_PASSPHRASE_LEN,
        ),
        salt in any::<u64>(),
        iterations in 1u64..50,
    ) {
        let a = derive_wrapping_key(KeyFormat::Passphrase, &passphrase, salt, iterations).unwrap();
        let b = derive_wrapping_key(KeyFormat::Passphrase, &passphrase, salt, iterations).unwrap();
        prop_assert_eq!(a.as_bytes(), b.as_bytes());

        let other = derive_wrapping_key(
            KeyFormat::Passphrase,
            &passphrase,
            salt.wrapping_add(1),
            iterations,
        )
        .unwrap();
        prop_assert_ne!(a.as_bytes(), other.as_bytes());
    }

    #[test]
    fn wrapping_key_is_pbkdf2_of_little_endian_salt(
        passphrase in "[a-z ]{8,64}",
        salt in any::<u64>(),
        iterations in 1u64..20,
    ) {
        let passphrase = passphrase.as_bytes();
        let key = derive_wrapping_key(KeyFormat::Passphrase, passphrase, salt, iterations).unwrap();
        let mut expected = [0u8; 32];
        pbkdf2_hmac_sha1(passphrase, &salt.to_le_bytes(), iterations, &mut expected).unwrap();
        prop_assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn hex_keys_decode_to_their_bytes(bytes in proptest::array::uniform32(any::<u8>())) {
        let encoded = hex::encode(bytes);
        validate_material(KeyFormat::Hex, encoded.as_bytes()).unwrap();
        let key = derive_wrapping_key(KeyFormat::Hex, encoded.as_bytes(), 0, 0).unwrap();
        prop_assert_eq!(key.as_bytes(), &bytes);

        let upper = encoded.to_uppercase();
        let key = derive_wrapping_key(KeyFormat::Hex, upper.as_bytes(), 0, 0).unwrap();
        prop_assert_eq!(key.as_bytes(), &bytes);
    }

    #[test]
    fn passphrase_length_bounds(len in 0usize..100) {
        let result = validate_material(KeyFormat::Passphrase, &vec![b'x'; len]);
        if (MIN_PASSPHRASE_LEN..=MAX_PASSPHRASE_LEN).contains(&len) {
            prop_assert!(result.is_ok());
        } else {
            prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::InputValidation);
        }
    }

    #[test]
    fn raw_keys_must_be_exactly_32_bytes(len in 0usize..=33) {
        let result = validate_material(KeyFormat::Raw, &vec![0u8; len]);
        prop_assert_eq!(result.is_ok(), len == 32);
    }
}
