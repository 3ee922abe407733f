use proptest::prelude::*;
use mandate_auth::{Claims, JwtHs256Codec, TokenCodec};
use mandate_types::ScopeSet;

proptest! {
    #[test]
    fn jwt_expiry_respected(delta_secs in -3600i64..3600i64) {
        let codec = JwtHs256Codec::new("prop_secret");
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: "tester".into(),
            scope: ScopeSet::new(["tx:exec"]),
            restrictions: vec![],
            iat: now as u64,
            exp: (now + delta_secs).max(0) as u64,
            jti: "prop-test".into(),
        };
        let raw = tokio_test::block_on(codec.mint(&claims)).unwrap();
        let res = tokio_test::block_on(codec.parse(&raw));
        // Leeway is zero: anything at least a couple of seconds in the
        // future parses, anything in the past is rejected.
        if delta_secs >= 2 {
            prop_assert!(res.is_ok());
        } else if delta_secs < 0 {
            prop_assert!(res.is_err());
        }
    }
}

proptest! {
    #[test]
    fn jwt_roundtrip_preserves_claims(
        sub in "[a-z]{1,16}",
        scopes in proptest::collection::vec("[a-z:]{1,12}", 1..4),
        ttl in 60u64..86_400,
    ) {
        let codec = JwtHs256Codec::new("prop_secret");
        let now = chrono::Utc::now().timestamp() as u64;
        let claims = Claims::new(sub, ScopeSet::new(scopes), now, ttl);
        let raw = tokio_test::block_on(codec.mint(&claims)).unwrap();
        let parsed = tokio_test::block_on(codec.parse(&raw)).unwrap();
        prop_assert_eq!(parsed, claims);
    }
}
