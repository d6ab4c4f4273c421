// 文件职责：
// 1) 生成单次请求 nonce 与派生短期对称密钥（signed nonce）。
// 2) 计算明文链路的 HMAC-SHA256 请求签名。
// 3) 组装加密链路（RC4 链路）的参数集与 SHA-1 签名。

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::cipher::{self, CipherError};

type HmacSha256 = Hmac<Sha256>;

/// 生成单次请求 nonce：8 字节随机数拼接 4 字节大端分钟桶，base64 输出。
/// 分钟桶让 nonce 除随机性外还带有粗粒度时效。
pub fn nonce() -> String {
    nonce_at(unix_minutes())
}

/// 以指定分钟桶生成 nonce。
pub fn nonce_at(minute_bucket: u64) -> String {
    let mut raw = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut raw[..8]);
    raw[8..].copy_from_slice(&(minute_bucket as u32).to_be_bytes());
    STANDARD.encode(raw)
}

/// 当前 Unix 分钟数。
fn unix_minutes() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 60
}

/// 派生短期对称密钥：SHA-256(b64d(ssecurity) ‖ b64d(nonce))，base64 输出。
/// 既作为 HMAC 签名密钥，也作为 RC4 流密钥。
pub fn signed_nonce(secret: &str, nonce: &str) -> Result<String, base64::DecodeError> {
    let mut sha = Sha256::new();
    sha.update(STANDARD.decode(secret)?);
    sha.update(STANDARD.decode(nonce)?);
    Ok(STANDARD.encode(sha.finalize()))
}

/// 明文链路请求签名：HMAC-SHA256，密钥为 b64d(signed_nonce)，
/// 签名串固定为 `uri&signed_nonce&nonce&data=<payload>`。
/// payload 的序列化文本即为实际发送文本，逐字节一致。
pub fn signature(
    uri: &str,
    signed_nonce: &str,
    nonce: &str,
    data: &str,
) -> Result<String, base64::DecodeError> {
    let sign = format!("{uri}&{signed_nonce}&{nonce}&data={data}");
    let key = STANDARD.decode(signed_nonce)?;
    let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
    mac.update(sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// 加密链路签名：SHA-1 over `METHOD&uri&k=v…&signed_nonce`，base64 输出。
/// 参数按传入顺序拼接，拼接顺序是签名契约的一部分。
pub fn encrypted_signature(
    method: &str,
    uri: &str,
    signed_nonce: &str,
    params: &[(String, String)],
) -> String {
    let mut parts = Vec::with_capacity(params.len() + 3);
    parts.push(method.to_uppercase());
    parts.push(uri.to_string());
    for (key, value) in params {
        parts.push(format!("{key}={value}"));
    }
    parts.push(signed_nonce.to_string());
    STANDARD.encode(Sha1::digest(parts.join("&").as_bytes()))
}

/// 组装加密链路参数集：
/// 先对明文参数计算 `rc4_hash__` 预签名，再逐值 RC4 加密，
/// 最后追加密文集签名与 `ssecurity`、`_nonce`。
pub fn encrypted_params(
    method: &str,
    uri: &str,
    signed_nonce: &str,
    nonce: &str,
    params: Vec<(String, String)>,
    ssecurity: &str,
) -> Result<Vec<(String, String)>, CipherError> {
    let mut params = params;
    let pre_sign = encrypted_signature(method, uri, signed_nonce, &params);
    params.push(("rc4_hash__".to_string(), pre_sign));

    for (_, value) in params.iter_mut() {
        *value = cipher::encrypt(signed_nonce, value)?;
    }

    let post_sign = encrypted_signature(method, uri, signed_nonce, &params);
    params.push(("signature".to_string(), post_sign));
    params.push(("ssecurity".to_string(), ssecurity.to_string()));
    params.push(("_nonce".to_string(), nonce.to_string()));
    Ok(params)
}
