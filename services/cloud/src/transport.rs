//! 传输模块职责：
//! 1. 为每次调用生成一次性 nonce，计算签名并发出阻塞式 HTTP POST。
//! 2. 支持两代线协议：明文签名链路与 RC4 全参数加密链路，由构造时显式选择。
//! 3. 解包 `{code, message|desc, result}` 响应信封并映射为类型化错误。

use std::time::Duration;

use chrono::Local;
use mjc_shared_protocol::{API_URL, ApiEnvelope, AuthPayload, DEFAULT_UA, cipher, sign};
use reqwest::{
    blocking::Client,
    header::{COOKIE, USER_AGENT},
};
use serde_json::Value;
use tracing::debug;

use crate::errors::{Error, Result};

/// 协议代际标头：声明请求参数使用 RC4 加密。
const ENCRYPT_ALGORITHM_HEADER: &str = "MIOT-ENCRYPT-ALGORITHM";
/// 客户端协议标志标头，两代链路都要求携带。
const PROTOCOL_FLAG_HEADER: &str = "x-xiaomi-protocal-flag-cli";
/// 协议标志值。
const PROTOCOL_FLAG: &str = "PROTOCAL-HTTP2";
/// 请求超时。
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 线协议代际；按调用场景显式选择，不做探测。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireProtocol {
    /// 明文 JSON 负载 + HMAC-SHA256 签名。
    #[default]
    Plain,
    /// 全参数 RC4 加密 + 密文集 SHA-1 签名。
    EncryptedRc4,
}

/// 签名请求传输器；每次调用只读借用会话凭证，自身无状态。
pub struct Transport {
    http: Client,
    protocol: WireProtocol,
}

impl Transport {
    pub fn new(protocol: WireProtocol) -> Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, protocol })
    }

    /// 发出一次签名调用并返回信封中的 `result`。
    pub fn call(&self, auth: &AuthPayload, uri: &str, data: &Value) -> Result<Value> {
        match self.protocol {
            WireProtocol::Plain => self.call_plain(auth, uri, data),
            WireProtocol::EncryptedRc4 => self.call_encrypted(auth, uri, data),
        }
    }

    /// 明文链路：`{_nonce, data, signature}` 表单体。
    fn call_plain(&self, auth: &AuthPayload, uri: &str, data: &Value) -> Result<Value> {
        // 签名串与发送串必须逐字节一致，序列化一次后两处共用。
        let data_text = serde_json::to_string(data)?;
        let nonce = sign::nonce();
        let signed_nonce = sign::signed_nonce(&auth.ssecurity, &nonce)?;
        let signature = sign::signature(uri, &signed_nonce, &nonce, &data_text)?;

        debug!("POST {uri} (plain)");
        let form = [
            ("_nonce", nonce.as_str()),
            ("data", data_text.as_str()),
            ("signature", signature.as_str()),
        ];
        let response = self
            .http
            .post(format!("{API_URL}{uri}"))
            .header(USER_AGENT, auth.ua.as_deref().unwrap_or(DEFAULT_UA))
            .header(PROTOCOL_FLAG_HEADER, PROTOCOL_FLAG)
            .header(COOKIE, plain_cookie(auth))
            .form(&form)
            .send()?;

        self.unwrap_response(response, &signed_nonce)
    }

    /// 加密链路：参数逐值 RC4 加密，响应体为 base64 密文。
    fn call_encrypted(&self, auth: &AuthPayload, uri: &str, data: &Value) -> Result<Value> {
        let data_text = serde_json::to_string(data)?;
        let nonce = sign::nonce();
        let signed_nonce = sign::signed_nonce(&auth.ssecurity, &nonce)?;
        let form = sign::encrypted_params(
            "POST",
            uri,
            &signed_nonce,
            &nonce,
            vec![("data".to_string(), data_text)],
            &auth.ssecurity,
        )?;

        debug!("POST {uri} (rc4)");
        let response = self
            .http
            .post(format!("{API_URL}{uri}"))
            .header(USER_AGENT, auth.ua.as_deref().unwrap_or(DEFAULT_UA))
            .header(PROTOCOL_FLAG_HEADER, PROTOCOL_FLAG)
            .header(ENCRYPT_ALGORITHM_HEADER, "ENCRYPT-RC4")
            .header("Accept-Encoding", "identity")
            .header(COOKIE, encrypted_cookie(auth))
            .form(&form)
            .send()?;

        self.unwrap_response(response, &signed_nonce)
    }

    /// 解包响应：先按 JSON 直读，失败再按 RC4 密文用本次派生密钥解密。
    fn unwrap_response(
        &self,
        response: reqwest::blocking::Response,
        signed_nonce: &str,
    ) -> Result<Value> {
        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(Error::Api {
                code: i64::from(status.as_u16()),
                message: format!("HTTP {status}"),
            });
        }

        let value: Value = match serde_json::from_str(body.trim()) {
            Ok(value) => value,
            Err(_) => serde_json::from_str(&cipher::decrypt(signed_nonce, body.trim())?)?,
        };
        unwrap_envelope(value)
    }
}

/// 信封解包：非零 code 映射为 API 错误，零则取出 result。
pub(crate) fn unwrap_envelope(value: Value) -> Result<Value> {
    let envelope: ApiEnvelope = serde_json::from_value(value)?;
    if envelope.code != 0 {
        return Err(Error::Api {
            code: envelope.code,
            message: envelope.describe().to_string(),
        });
    }
    Ok(envelope.result.unwrap_or(Value::Null))
}

/// 明文链路会话 cookie。
fn plain_cookie(auth: &AuthPayload) -> String {
    format!(
        "PassportDeviceId={};userId={};serviceToken={};",
        auth.device_id, auth.user_id, auth.service_token
    )
}

/// 加密链路会话 cookie：在明文链路基础上追加区域/时区/渠道字段。
fn encrypted_cookie(auth: &AuthPayload) -> String {
    let locale = auth.locale.as_deref().unwrap_or("zh_CN");
    format!(
        "PassportDeviceId={};userId={};serviceToken={};locale={};timezone={};channel=MI_APP_STORE;",
        auth.device_id,
        auth.user_id,
        auth.service_token,
        locale,
        local_timezone()
    )
}

/// 本地时区的 `GMT±HH:MM` 表示。
fn local_timezone() -> String {
    let offset = Local::now().offset().local_minus_utc();
    let sign = if offset < 0 { '-' } else { '+' };
    let total = offset.abs();
    format!("GMT{sign}{:02}:{:02}", total / 3600, (total % 3600) / 60)
}

#[cfg(test)]
mod tests {
    use mjc_shared_protocol::AuthPayload;
    use serde_json::json;

    use super::{encrypted_cookie, plain_cookie, unwrap_envelope};
    use crate::errors::Error;

    fn test_auth() -> AuthPayload {
        AuthPayload {
            user_id: 987654,
            device_id: "abcdef0123456789".to_string(),
            ssecurity: "TGV0c1Rlc3RTU2VjdXJpdHkwMDE=".to_string(),
            service_token: "tok".to_string(),
            expire_time: None,
            c_user_id: None,
            locale: None,
            ua: None,
        }
    }

    #[test]
    fn plain_cookie_carries_signing_identity() {
        let cookie = plain_cookie(&test_auth());
        assert_eq!(
            cookie,
            "PassportDeviceId=abcdef0123456789;userId=987654;serviceToken=tok;"
        );
    }

    #[test]
    fn encrypted_cookie_adds_locale_timezone_channel() {
        let cookie = encrypted_cookie(&test_auth());
        assert!(cookie.contains("locale=zh_CN;"));
        assert!(cookie.contains("timezone=GMT"));
        assert!(cookie.contains("channel=MI_APP_STORE;"));
    }

    #[test]
    fn envelope_zero_code_yields_result() {
        let value = json!({"code": 0, "message": "ok", "result": [1, 2]});
        assert_eq!(unwrap_envelope(value).unwrap(), json!([1, 2]));
    }

    #[test]
    fn envelope_nonzero_code_maps_to_api_error() {
        let value = json!({"code": -10005, "message": "denied"});
        match unwrap_envelope(value).unwrap_err() {
            Error::Api { code, message } => {
                assert_eq!(code, -10005);
                assert_eq!(message, "denied");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn envelope_desc_field_is_accepted() {
        let value = json!({"code": 2, "desc": "bad request"});
        match unwrap_envelope(value).unwrap_err() {
            Error::Api { code, message } => {
                assert_eq!(code, 2);
                assert_eq!(message, "bad request");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
