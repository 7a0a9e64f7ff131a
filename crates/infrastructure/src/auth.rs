//! JWT 身份校验
//!
//! 凭证签发属于外部身份服务的职责，这里同时提供签发只是为了
//! 让运维脚本和集成测试能造出合法凭证。投递核心只依赖
//! `IdentityVerifier` 这一面。

use application::{IdentityError, IdentityVerifier};
use async_trait::async_trait;
use config::JwtConfig;
use domain::UserId;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

pub struct JwtAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiration_hours: i64,
}

impl JwtAuthority {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_ref()),
            decoding_key: DecodingKey::from_secret(config.secret.as_ref()),
            expiration_hours: config.expiration_hours,
        }
    }

    /// 签发一个带过期时间的凭证。
    pub fn issue(&self, user_id: UserId) -> Result<String, IdentityError> {
        let exp = chrono::Utc::now() + chrono::Duration::hours(self.expiration_hours);
        let claims = Claims {
            user_id: user_id.into(),
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| IdentityError::failure(format!("token generation failed: {err}")))
    }
}

#[async_trait]
impl IdentityVerifier for JwtAuthority {
    async fn verify(&self, token: &str) -> Result<Option<UserId>, IdentityError> {
        match decode::<Claims>(token, &self.decoding_key, &Validation::default()) {
            Ok(data) => Ok(Some(UserId::from(data.claims.user_id))),
            Err(err) => {
                // 过期、签名不符、格式错误都属于凭证无效，不是校验故障
                tracing::debug!(error = %err, "凭证校验未通过");
                Ok(None)
            }
        }
    }
}
