//! Canonical signing for the VNPAY redirect protocol.
//!
//! Parameters are sorted by key, empty values dropped, values form-encoded
//! (space as `+`), joined as `k=v&k=v` and signed with HMAC-SHA512. The hex
//! digest travels as `vnp_SecureHash`.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sha2::Sha512;
use std::collections::BTreeMap;
use tracing::warn;
use url::form_urlencoded::byte_serialize;

use crate::config::{CallbackEncoding, PaymentGatewayConfig};
use crate::errors::ServiceError;

type HmacSha512 = Hmac<Sha512>;

pub const SECURE_HASH: &str = "vnp_SecureHash";
pub const SECURE_HASH_TYPE: &str = "vnp_SecureHashType";
pub const PARAM_PREFIX: &str = "vnp_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Everything needed to sign one payment attempt.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub order_number: String,
    pub amount: Decimal,
    pub ip_addr: String,
    pub txn_ref: String,
    pub return_url: Option<String>,
    pub bank_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPaymentUrl {
    pub url: String,
    pub txn_ref: String,
    pub secure_hash: String,
    pub expires_at: DateTime<Utc>,
}

fn encode_value(value: &str, encoding: CallbackEncoding) -> String {
    match encoding {
        CallbackEncoding::Form => byte_serialize(value.as_bytes()).collect(),
        CallbackEncoding::Raw => value.to_string(),
    }
}

/// The exact byte string the signature covers.
pub fn canonical_query(params: &BTreeMap<String, String>, encoding: CallbackEncoding) -> String {
    params
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, encode_value(v, encoding)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Lowercase hex HMAC-SHA512.
pub fn sign(secret: &str, data: &str) -> Result<String, ServiceError> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("Invalid signing key: {}", e)))?;
    mac.update(data.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Amount in the gateway's smallest unit.
pub fn gateway_amount(amount: Decimal, multiplier: i64) -> Result<i64, ServiceError> {
    (amount * Decimal::from(multiplier))
        .round()
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("Amount {} out of range", amount)))
}

#[derive(Debug, Clone)]
pub struct PaymentSigner {
    config: PaymentGatewayConfig,
}

impl PaymentSigner {
    pub fn new(config: PaymentGatewayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PaymentGatewayConfig {
        &self.config
    }

    fn offset(&self) -> Result<FixedOffset, ServiceError> {
        FixedOffset::east_opt(self.config.timezone_offset_minutes * 60).ok_or_else(|| {
            ServiceError::InternalError(format!(
                "Invalid gateway timezone offset {} minutes",
                self.config.timezone_offset_minutes
            ))
        })
    }

    pub fn format_timestamp(&self, at: DateTime<Utc>) -> Result<String, ServiceError> {
        Ok(at
            .with_timezone(&self.offset()?)
            .format(TIMESTAMP_FORMAT)
            .to_string())
    }

    /// Unsigned parameter set for a payment attempt.
    pub fn build_params(
        &self,
        req: &PaymentRequest,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        let cfg = &self.config;
        let expires_at = req.created_at + Duration::minutes(cfg.expire_minutes);

        let mut params = BTreeMap::new();
        params.insert("vnp_Version".to_string(), cfg.version.clone());
        params.insert("vnp_Command".to_string(), cfg.command.clone());
        params.insert("vnp_TmnCode".to_string(), cfg.tmn_code.clone());
        params.insert(
            "vnp_Amount".to_string(),
            gateway_amount(req.amount, cfg.amount_multiplier)?.to_string(),
        );
        params.insert(
            "vnp_CreateDate".to_string(),
            self.format_timestamp(req.created_at)?,
        );
        params.insert(
            "vnp_ExpireDate".to_string(),
            self.format_timestamp(expires_at)?,
        );
        params.insert("vnp_CurrCode".to_string(), cfg.currency.clone());
        params.insert("vnp_IpAddr".to_string(), req.ip_addr.clone());
        params.insert("vnp_Locale".to_string(), cfg.locale.clone());
        params.insert(
            "vnp_OrderInfo".to_string(),
            format!("Payment for order {}", req.order_number),
        );
        params.insert("vnp_OrderType".to_string(), cfg.order_type.clone());
        params.insert(
            "vnp_ReturnUrl".to_string(),
            req.return_url
                .clone()
                .unwrap_or_else(|| cfg.return_url.clone()),
        );
        params.insert("vnp_TxnRef".to_string(), req.txn_ref.clone());
        if let Some(bank_code) = req.bank_code.as_ref().filter(|b| !b.is_empty()) {
            params.insert("vnp_BankCode".to_string(), bank_code.clone());
        }

        Ok(params)
    }

    /// Signed redirect URL for the gateway.
    pub fn build_url(&self, req: &PaymentRequest) -> Result<SignedPaymentUrl, ServiceError> {
        if !self.config.is_configured() {
            return Err(ServiceError::ExternalServiceError(
                "Payment gateway is not configured".to_string(),
            ));
        }

        let params = self.build_params(req)?;
        let canonical = canonical_query(&params, CallbackEncoding::Form);
        let secure_hash = sign(&self.config.hash_secret, &canonical)?;

        Ok(SignedPaymentUrl {
            url: format!(
                "{}?{}&{}={}",
                self.config.payment_url, canonical, SECURE_HASH, secure_hash
            ),
            txn_ref: req.txn_ref.clone(),
            secure_hash,
            expires_at: req.created_at + Duration::minutes(self.config.expire_minutes),
        })
    }

    /// Checks the signature on a gateway callback.
    ///
    /// Only `vnp_*` parameters are covered; the hash and hash-type fields
    /// are excluded. The comparison is constant time.
    pub fn verify(&self, params: &BTreeMap<String, String>) -> Result<(), ServiceError> {
        let provided = params
            .get(SECURE_HASH)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServiceError::SecurityError("Missing signature".to_string()))?;

        let signed: BTreeMap<String, String> = params
            .iter()
            .filter(|(k, _)| {
                k.starts_with(PARAM_PREFIX) && *k != SECURE_HASH && *k != SECURE_HASH_TYPE
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let canonical = canonical_query(&signed, self.config.callback_encoding);

        let provided_bytes = hex::decode(provided).map_err(|_| {
            warn!("Callback signature is not valid hex");
            ServiceError::SecurityError("Malformed signature".to_string())
        })?;

        let mut mac = HmacSha512::new_from_slice(self.config.hash_secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("Invalid signing key: {}", e)))?;
        mac.update(canonical.as_bytes());
        mac.verify_slice(&provided_bytes).map_err(|_| {
            warn!(
                txn_ref = params.get("vnp_TxnRef").map(String::as_str).unwrap_or(""),
                "Callback signature mismatch"
            );
            ServiceError::SecurityError("Signature mismatch".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    const SECRET: &str = "TESTSECRETKEY0123456789";

    fn signer() -> PaymentSigner {
        PaymentSigner::new(PaymentGatewayConfig {
            tmn_code: "DEMO0001".into(),
            hash_secret: SECRET.into(),
            return_url: "https://shop.example.com/api/v1/payments/vnpay/return".into(),
            ..Default::default()
        })
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            order_number: "ORD-20240301-0000002A".into(),
            amount: dec!(300000),
            ip_addr: "127.0.0.1".into(),
            txn_ref: "abc_1".into(),
            return_url: None,
            bank_code: None,
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 3, 30, 0).unwrap(),
        }
    }

    fn query_map(url: &str) -> BTreeMap<String, String> {
        let parsed = url::Url::parse(url).unwrap();
        parsed.query_pairs().into_owned().collect()
    }

    #[test]
    fn hmac_sha512_matches_rfc4231_vector() {
        assert_eq!(
            sign("Jefe", "what do ya want for nothing?").unwrap(),
            "164b7a7bfcf819e2e395fbe73b56e0a387bd64222e831fd610270cd7ea2505549758bf75c05a994a6d034f65f8f0e6fdcaeab1a34d4a6b4b636e070a38bce737"
        );
    }

    #[test]
    fn canonical_string_is_sorted_and_form_encoded() {
        let params = signer().build_params(&request()).unwrap();
        assert_eq!(
            canonical_query(&params, CallbackEncoding::Form),
            "vnp_Amount=30000000&vnp_Command=pay&vnp_CreateDate=20240301103000\
             &vnp_CurrCode=VND&vnp_ExpireDate=20240301104500&vnp_IpAddr=127.0.0.1\
             &vnp_Locale=vn&vnp_OrderInfo=Payment+for+order+ORD-20240301-0000002A\
             &vnp_OrderType=other\
             &vnp_ReturnUrl=https%3A%2F%2Fshop.example.com%2Fapi%2Fv1%2Fpayments%2Fvnpay%2Freturn\
             &vnp_TmnCode=DEMO0001&vnp_TxnRef=abc_1&vnp_Version=2.1.0"
        );
    }

    #[test]
    fn signed_url_carries_known_digest() {
        let signed = signer().build_url(&request()).unwrap();
        assert_eq!(
            signed.secure_hash,
            "1d1866f867ada4c6555b2eed4729c250954fc1374519a1bb5999a5e3f21bbbf6de54cbcc3d39806861301866182b1c162d2230435b698cfdd761ac10f9c74cb5"
        );
        assert!(signed
            .url
            .starts_with("https://sandbox.vnpayment.vn/paymentv2/vpcpay.html?vnp_Amount=30000000&"));
        assert!(signed.url.ends_with(&format!("&vnp_SecureHash={}", signed.secure_hash)));
    }

    #[test]
    fn empty_values_are_skipped() {
        let mut params = BTreeMap::new();
        params.insert("b".to_string(), "2".to_string());
        params.insert("a".to_string(), String::new());
        params.insert("c".to_string(), "x y".to_string());
        assert_eq!(canonical_query(&params, CallbackEncoding::Form), "b=2&c=x+y");
        assert_eq!(canonical_query(&params, CallbackEncoding::Raw), "b=2&c=x y");
    }

    #[test]
    fn bank_code_is_forwarded_when_present() {
        let mut req = request();
        req.bank_code = Some("NCB".into());
        let params = signer().build_params(&req).unwrap();
        assert_eq!(params.get("vnp_BankCode").map(String::as_str), Some("NCB"));
    }

    #[test]
    fn unconfigured_gateway_refuses_to_sign() {
        let signer = PaymentSigner::new(PaymentGatewayConfig::default());
        assert!(matches!(
            signer.build_url(&request()),
            Err(ServiceError::ExternalServiceError(_))
        ));
    }

    #[test]
    fn callback_built_from_redirect_verifies() {
        let signer = signer();
        let signed = signer.build_url(&request()).unwrap();
        let params = query_map(&signed.url);
        signer.verify(&params).unwrap();
    }

    #[test]
    fn tampered_or_missing_signature_is_rejected() {
        let signer = signer();
        let signed = signer.build_url(&request()).unwrap();

        let mut tampered = query_map(&signed.url);
        tampered.insert("vnp_Amount".into(), "100".into());
        assert!(matches!(
            signer.verify(&tampered),
            Err(ServiceError::SecurityError(_))
        ));

        let mut missing = query_map(&signed.url);
        missing.remove(SECURE_HASH);
        assert!(matches!(signer.verify(&missing), Err(ServiceError::SecurityError(_))));

        let mut garbage = query_map(&signed.url);
        garbage.insert(SECURE_HASH.into(), "not-hex".into());
        assert!(matches!(signer.verify(&garbage), Err(ServiceError::SecurityError(_))));
    }

    #[test]
    fn hash_type_and_foreign_params_are_ignored() {
        let signer = signer();
        let signed = signer.build_url(&request()).unwrap();
        let mut params = query_map(&signed.url);
        params.insert(SECURE_HASH_TYPE.into(), "HmacSHA512".into());
        params.insert("utm_source".into(), "mail".into());
        signer.verify(&params).unwrap();
    }

    #[test]
    fn uppercase_hex_signature_is_accepted() {
        let signer = signer();
        let signed = signer.build_url(&request()).unwrap();
        let mut params = query_map(&signed.url);
        params.insert(SECURE_HASH.into(), signed.secure_hash.to_uppercase());
        signer.verify(&params).unwrap();
    }

    #[test]
    fn amount_is_scaled_to_smallest_unit() {
        assert_eq!(gateway_amount(dec!(300000), 100).unwrap(), 30_000_000);
        assert_eq!(gateway_amount(dec!(12.345), 100).unwrap(), 1_234);
    }

    proptest! {
        #[test]
        fn signing_is_deterministic_and_key_sensitive(
            info in "[a-zA-Z0-9 ./:-]{1,40}",
            amount in 1i64..1_000_000_000,
        ) {
            let mut params = BTreeMap::new();
            params.insert("vnp_OrderInfo".to_string(), info);
            params.insert("vnp_Amount".to_string(), amount.to_string());
            let data = canonical_query(&params, CallbackEncoding::Form);
            prop_assert_eq!(sign(SECRET, &data).unwrap(), sign(SECRET, &data).unwrap());
            prop_assert_ne!(sign(SECRET, &data).unwrap(), sign("other-secret", &data).unwrap());
        }
    }
}
