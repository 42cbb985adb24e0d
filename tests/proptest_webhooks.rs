//! Property-based tests for the intake primitives.
//!
//! Uses proptest to check signature, topic routing, idempotency key and
//! PII masking invariants over generated inputs.

use proptest::prelude::*;

use wishcraft_webhooks::audit::{mask_email, mask_id, redacted_shop_id};
use wishcraft_webhooks::crypto::GiftMessageCipher;
use wishcraft_webhooks::model::ShopDomain;
use wishcraft_webhooks::webhooks::{sign_with, IdempotencyKey, SignatureVerifier, Topic};

// ============================================================================
// STRATEGIES
// ============================================================================

/// Any handled topic
pub fn arb_topic() -> impl Strategy<Value = Topic> {
    prop::sample::select(Topic::ALL.to_vec())
}

/// A topic name rewritten with another separator and random casing
pub fn arb_topic_spelling() -> impl Strategy<Value = (Topic, String)> {
    (
        arb_topic(),
        prop::sample::select(vec!['/', '.', '_', '-']),
        any::<bool>(),
    )
        .prop_map(|(topic, sep, upper)| {
            let spelled: String = topic
                .as_str()
                .chars()
                .map(|c| if c == '/' || c == '_' { sep } else { c })
                .collect();
            let spelled = if upper { spelled.to_uppercase() } else { spelled };
            (topic, spelled)
        })
}

/// Valid shop domains
pub fn arb_shop() -> impl Strategy<Value = ShopDomain> {
    "[a-z][a-z0-9-]{0,20}".prop_map(|name| {
        ShopDomain::parse(&format!("{name}.myshopify.com")).expect("generated domain is valid")
    })
}

// ============================================================================
// SIGNATURES
// ============================================================================

proptest! {
    #[test]
    fn prop_signed_body_verifies(
        secret in prop::collection::vec(any::<u8>(), 1..64),
        body in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let verifier = SignatureVerifier::new(&secret);
        let header = sign_with(&secret, &body);
        prop_assert!(verifier.verify(&body, Some(&header)).is_valid());
    }

    #[test]
    fn prop_tampered_body_fails(
        body in prop::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let verifier = SignatureVerifier::new("shared-secret");
        let header = verifier.sign(&body);

        let mut tampered = body.clone();
        let at = index.index(tampered.len());
        tampered[at] ^= flip;

        prop_assert!(!verifier.verify(&tampered, Some(&header)).is_valid());
    }

    #[test]
    fn prop_garbage_header_never_verifies(header in ".{0,64}") {
        let verifier = SignatureVerifier::new("shared-secret");
        let body = b"{\"id\":1}";
        prop_assume!(header.trim() != verifier.sign(body));
        prop_assert!(!verifier.verify(body, Some(&header)).is_valid());
    }
}

// ============================================================================
// TOPIC ROUTING
// ============================================================================

proptest! {
    #[test]
    fn prop_topic_spellings_resolve((topic, spelled) in arb_topic_spelling()) {
        prop_assert_eq!(Topic::parse(&spelled), Some(topic));
    }

    #[test]
    fn prop_unrelated_names_are_unknown(name in "[a-z]{1,12}/[a-z]{1,12}") {
        let known = Topic::ALL
            .iter()
            .any(|t| t.as_str().replace(['/', '_'], "") == name.replace('/', ""));
        prop_assume!(!known);
        prop_assert_eq!(Topic::parse(&name), None);
    }
}

// ============================================================================
// IDEMPOTENCY KEYS
// ============================================================================

proptest! {
    #[test]
    fn prop_key_is_stable(
        shop in arb_shop(),
        topic in arb_topic(),
        body in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let a = IdempotencyKey::derive(&shop, topic, None, &body);
        let b = IdempotencyKey::derive(&shop, topic, None, &body);
        prop_assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn prop_webhook_id_ignores_body(
        shop in arb_shop(),
        topic in arb_topic(),
        id in "[a-f0-9-]{8,36}",
        a in prop::collection::vec(any::<u8>(), 0..64),
        b in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let first = IdempotencyKey::derive(&shop, topic, Some(&id), &a);
        let second = IdempotencyKey::derive(&shop, topic, Some(&id), &b);
        prop_assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn prop_keys_are_tenant_scoped(
        a in arb_shop(),
        b in arb_shop(),
        topic in arb_topic(),
    ) {
        prop_assume!(a != b);
        let body = b"{}";
        prop_assert_ne!(
            IdempotencyKey::derive(&a, topic, Some("wh-1"), body).to_string(),
            IdempotencyKey::derive(&b, topic, Some("wh-1"), body).to_string()
        );
    }
}

// ============================================================================
// PII MASKING
// ============================================================================

proptest! {
    #[test]
    fn prop_masked_email_hides_local_part(local in "[a-z]{3,20}", domain in "[a-z]{2,10}\\.com") {
        let masked = mask_email(&format!("{local}@{domain}"));
        let (masked_local, _) = masked.split_once('@').unwrap();
        prop_assert!(!masked_local.contains(&local));
        let expected_suffix = format!("@{domain}");
        prop_assert!(masked.ends_with(&expected_suffix));
    }

    #[test]
    fn prop_masked_id_keeps_only_tail(id in 10_000i64..i64::MAX) {
        let raw = id.to_string();
        let masked = mask_id(&raw);
        prop_assert!(masked.starts_with("****"));
        prop_assert!(!masked.contains(&raw));
    }

    #[test]
    fn prop_redacted_fingerprint_hides_domain(shop in arb_shop()) {
        let fingerprint = redacted_shop_id(&shop);
        prop_assert!(fingerprint.starts_with("redacted-"));
        prop_assert!(!fingerprint.contains(shop.as_str()));
    }

    #[test]
    fn prop_gift_message_ciphertext_differs(message in "[ -~]{1,200}") {
        let cipher = GiftMessageCipher::new([9u8; 32]);
        let stored = cipher.encrypt(&message).unwrap();
        prop_assert_ne!(&stored, &message);
        prop_assert_eq!(cipher.decrypt(&stored).unwrap(), message);
    }
}
