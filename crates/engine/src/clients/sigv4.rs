// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Minimal AWS Signature Version 4 signer for unsigned-body GET requests,
/// used against the control-plane API (§6: "signed using the deployment's
/// AWS-style v4 signing scheme").
pub struct SigV4Signer<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub session_token: Option<&'a str>,
    pub region: &'a str,
    pub service: &'a str,
}

pub struct SignedHeaders {
    pub x_amz_date: String,
    pub authorization: String,
    pub x_amz_security_token: Option<String>,
}

impl<'a> SigV4Signer<'a> {
    /// Signs a `GET host/path?query` request with no body.
    pub fn sign_get(&self, host: &str, path: &str, query: &str, now: DateTime<Utc>) -> SignedHeaders {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let empty_payload_hash = hex::encode(Sha256::digest(b""));
        let canonical_headers = format!("host:{host}\nx-amz-date:{amz_date}\n");
        let signed_headers = "host;x-amz-date";

        let canonical_request = format!(
            "GET\n{path}\n{query}\n{canonical_headers}\n{signed_headers}\n{empty_payload_hash}"
        );

        let credential_scope = format!("{date_stamp}/{}/{}/aws4_request", self.region, self.service);
        let canonical_request_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign =
            format!("AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{canonical_request_hash}");

        let signing_key = self.derive_signing_key(&date_stamp);
        let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key_id
        );

        SignedHeaders {
            x_amz_date: amz_date,
            authorization,
            x_amz_security_token: self.session_token.map(str::to_string),
        }
    }

    fn derive_signing_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_date = hmac(
            format!("AWS4{}", self.secret_access_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = hmac(&k_date, self.region.as_bytes());
        let k_service = hmac(&k_region, self.service.as_bytes());
        hmac(&k_service, b"aws4_request")
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn produces_stable_signature_for_fixed_input() {
        let signer = SigV4Signer {
            access_key_id: "AKIDEXAMPLE",
            secret_access_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY",
            session_token: None,
            region: "us-east-1",
            service: "execute-api",
        };
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        let signed = signer.sign_get("example.com", "/rules/enabled", "type=RULE", now);
        assert_eq!(signed.x_amz_date, "20150830T123600Z");
        assert!(signed.authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/execute-api/aws4_request"));
    }
}
