// 文件职责：
// 1) 定义米家云端 API 的固定入口地址与公共请求头常量。
// 2) 提供带前缀 JSON 响应的剥离/解析与统一响应包裹类型。
// 3) 作为 Rust 侧协议唯一代码源，签名、加解密、错误码表均在本 crate。

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod cipher;
pub mod codes;
pub mod miot;
pub mod sign;

/// 登录索引页（serviceLogin），返回 `qs/_sign/callback/location` 参数。
pub const INDEX_URL: &str = "https://account.xiaomi.com/pass/serviceLogin?sid=xiaomiio&_json=true";
/// 账号密码登录提交地址。
pub const LOGIN_URL: &str = "https://account.xiaomi.com/pass/serviceLoginAuth2";
/// 二维码登录地址（长轮询签发）。
pub const QR_URL: &str = "https://account.xiaomi.com/longPolling/loginUrl";
/// 业务 API 基地址，所有签名请求都 POST 到该前缀下。
pub const API_URL: &str = "https://api.io.mi.com/app";
/// 设备规格目录基地址，按 model 查询。
pub const SPEC_URL: &str = "https://home.miot-spec.com/spec";

/// 登录态接口统一使用的移动端 User-Agent。
pub const DEFAULT_UA: &str =
    "APP/com.xiaomi.mihome APPV/6.0.103 iosPassportSDK/3.9.0 iOS/14.4 miHSTS";
/// 登录索引 cookie 中声明的 SDK 版本。
pub const SDK_VERSION: &str = "3.4.1";

/// 账号服务响应统一携带的反劫持前缀，固定 11 个字符。
pub const JSON_PREFIX: &str = "&&&START&&&";

/// 剥离账号服务响应前缀；无前缀时按固定 11 字符偏移处理。
pub fn strip_json_prefix(text: &str) -> &str {
    if let Some(rest) = text.strip_prefix(JSON_PREFIX) {
        return rest;
    }
    text.get(JSON_PREFIX.len()..).unwrap_or("")
}

/// 解析带前缀的账号服务 JSON 响应。
pub fn parse_prefixed(text: &str) -> serde_json::Result<Value> {
    serde_json::from_str(strip_json_prefix(text))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope {
    // 业务返回码，0 表示成功。
    pub code: i64,
    // 错误描述（新接口字段）。
    #[serde(default)]
    pub message: Option<String>,
    // 错误描述（账号服务字段）。
    #[serde(default)]
    pub desc: Option<String>,
    // 业务数据，仅 code == 0 时有意义。
    #[serde(default)]
    pub result: Option<Value>,
}

impl ApiEnvelope {
    /// 取错误描述：优先 `message`，回退 `desc`，都缺失时给占位文本。
    pub fn describe(&self) -> &str {
        self.message
            .as_deref()
            .or(self.desc.as_deref())
            .unwrap_or("无错误描述")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    // 账号数字 ID。
    #[serde(rename = "userId")]
    pub user_id: i64,
    // 本地生成的 16 位设备标识。
    #[serde(rename = "deviceId")]
    pub device_id: String,
    // 登录签发的共享密钥，签名与加解密的根。
    pub ssecurity: String,
    // 会话 cookie 凭证。
    #[serde(rename = "serviceToken")]
    pub service_token: String,
    // 会话过期时间估计（本地时区，`YYYY-MM-DD HH:MM:SS`）。
    #[serde(rename = "expireTime", default, skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<String>,
    // 国际版账号附加 ID。
    #[serde(rename = "cUserId", default, skip_serializing_if = "Option::is_none")]
    pub c_user_id: Option<String>,
    // 会话语言区域。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    // 签发会话时使用的 User-Agent。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ua: Option<String>,
}

impl AuthPayload {
    /// 签名所需字段是否齐备：缺任意一个则整个会话不可用。
    pub fn is_complete(&self) -> bool {
        self.user_id != 0
            && !self.device_id.is_empty()
            && !self.ssecurity.is_empty()
            && !self.service_token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthPayload, JSON_PREFIX, parse_prefixed, strip_json_prefix};

    #[test]
    fn prefix_is_eleven_chars() {
        assert_eq!(JSON_PREFIX.len(), 11);
    }

    #[test]
    fn strip_handles_literal_prefix_and_offset() {
        assert_eq!(strip_json_prefix("&&&START&&&{\"code\":0}"), "{\"code\":0}");
        assert_eq!(strip_json_prefix("ABCDEFGHIJK{\"code\":0}"), "{\"code\":0}");
        assert_eq!(strip_json_prefix("short"), "");
    }

    #[test]
    fn parse_prefixed_reads_json_body() {
        let value = parse_prefixed("&&&START&&&{\"code\":0,\"qs\":\"x\"}").unwrap();
        assert_eq!(value["code"], 0);
        assert_eq!(value["qs"], "x");
    }

    #[test]
    fn auth_payload_completeness_requires_all_signing_fields() {
        let mut auth = AuthPayload {
            user_id: 12345,
            device_id: "abcdef0123456789".to_string(),
            ssecurity: "c2VjcmV0".to_string(),
            service_token: "token".to_string(),
            expire_time: None,
            c_user_id: None,
            locale: None,
            ua: None,
        };
        assert!(auth.is_complete());
        auth.ssecurity.clear();
        assert!(!auth.is_complete());
    }

    #[test]
    fn auth_payload_roundtrips_wire_field_names() {
        let raw = r#"{"userId":42,"deviceId":"d","ssecurity":"s","serviceToken":"t"}"#;
        let auth: AuthPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(auth.user_id, 42);
        let encoded = serde_json::to_string(&auth).unwrap();
        assert!(encoded.contains("\"serviceToken\":\"t\""));
        assert!(!encoded.contains("expireTime"));
    }
}
