use std::collections::BTreeMap;

use proptest::prelude::*;
use storefront_checkout::{
    config::{CallbackEncoding, PaymentGatewayConfig},
    entities::FulfillmentStatus,
    services::payment_signer::{canonical_query, sign, PaymentSigner, SECURE_HASH},
};
use sea_orm::Iterable;

const SECRET: &str = "TESTSECRETKEY0123456789";

fn signer(encoding: CallbackEncoding) -> PaymentSigner {
    PaymentSigner::new(PaymentGatewayConfig {
        tmn_code: "DEMO0001".into(),
        hash_secret: SECRET.into(),
        callback_encoding: encoding,
        ..Default::default()
    })
}

fn any_status() -> impl Strategy<Value = FulfillmentStatus> {
    prop::sample::select(FulfillmentStatus::iter().collect::<Vec<_>>())
}

fn callback_params() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(
        "vnp_[A-Z][a-zA-Z]{2,12}",
        "[a-zA-Z0-9 ._:/-]{1,24}",
        1..8,
    )
}

proptest! {
    #[test]
    fn terminal_states_have_no_exits(from in any_status(), to in any_status()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
        prop_assert!(!from.can_transition_to(from));
    }

    #[test]
    fn only_early_states_can_be_cancelled(from in any_status()) {
        let cancellable = FulfillmentStatus::cancellable().contains(&from);
        prop_assert_eq!(from.can_transition_to(FulfillmentStatus::Cancelled), cancellable);
    }

    #[test]
    fn walks_follow_a_single_forward_path(steps in prop::collection::vec(any_status(), 0..12)) {
        let order = [
            FulfillmentStatus::Pending,
            FulfillmentStatus::Confirmed,
            FulfillmentStatus::Processing,
            FulfillmentStatus::Shipping,
            FulfillmentStatus::Delivered,
        ];
        let rank = |s: FulfillmentStatus| order.iter().position(|o| *o == s);

        let mut current = FulfillmentStatus::Pending;
        for next in steps {
            if current.can_transition_to(next) {
                if next != FulfillmentStatus::Cancelled {
                    prop_assert_eq!(rank(next), rank(current).map(|r| r + 1));
                }
                current = next;
            }
        }
    }

    #[test]
    fn any_edit_breaks_the_signature(
        params in callback_params(),
        pick in any::<prop::sample::Index>(),
        suffix in "[a-z0-9]{1,4}",
        raw in any::<bool>(),
    ) {
        let encoding = if raw { CallbackEncoding::Raw } else { CallbackEncoding::Form };
        let signer = signer(encoding);

        let mut signed = params.clone();
        signed.insert(
            SECURE_HASH.to_string(),
            sign(SECRET, &canonical_query(&params, encoding)).unwrap(),
        );
        prop_assert!(signer.verify(&signed).is_ok());

        let key = pick.get(&params.keys().cloned().collect::<Vec<_>>()).clone();
        let mut tampered = signed.clone();
        tampered.get_mut(&key).unwrap().push_str(&suffix);
        prop_assert!(signer.verify(&tampered).is_err());
    }
}
