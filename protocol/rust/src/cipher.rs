// 文件职责：
// 1) 实现加密链路使用的 RC4 流加解密，密钥为 b64d(signed_nonce)。
// 2) 丢弃前 1024 字节密钥流后再使用（drop-1024 变体）。
// 3) 解密结果优先按 UTF-8 解读，失败时按 gzip 解压，两者都是正常路径。

use std::io::Read;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use flate2::read::GzDecoder;
use rc4::{KeyInit, Rc4, StreamCipher, consts::U32};
use thiserror::Error;

/// RC4 密钥流预热长度；两端必须一致，少丢一个字节解出来都是乱码。
const KEYSTREAM_DROP: usize = 1024;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("base64 解码失败: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("RC4 密钥长度错误: 期望 32 字节，实际 {0} 字节")]
    KeyLength(usize),
    #[error("解密结果既不是 UTF-8 文本也不是 gzip 数据")]
    Garbled,
}

/// 构造已预热的 RC4 密钥流。
fn primed_rc4(signed_nonce: &str) -> Result<Rc4<U32>, CipherError> {
    let decoded = STANDARD.decode(signed_nonce)?;
    let key: [u8; 32] = decoded
        .try_into()
        .map_err(|raw: Vec<u8>| CipherError::KeyLength(raw.len()))?;
    let mut rc4 = Rc4::new((&key).into());
    let mut warmup = [0u8; KEYSTREAM_DROP];
    rc4.apply_keystream(&mut warmup);
    Ok(rc4)
}

/// 加密明文并 base64 输出。
pub fn encrypt(signed_nonce: &str, plaintext: &str) -> Result<String, CipherError> {
    let mut buf = plaintext.as_bytes().to_vec();
    primed_rc4(signed_nonce)?.apply_keystream(&mut buf);
    Ok(STANDARD.encode(buf))
}

/// 解密 base64 密文，返回原始字节。
pub fn decrypt_bytes(signed_nonce: &str, payload: &str) -> Result<Vec<u8>, CipherError> {
    let mut buf = STANDARD.decode(payload)?;
    primed_rc4(signed_nonce)?.apply_keystream(&mut buf);
    Ok(buf)
}

/// 解密 base64 密文并还原为文本：UTF-8 直读失败时走 gzip 解压。
pub fn decrypt(signed_nonce: &str, payload: &str) -> Result<String, CipherError> {
    let raw = decrypt_bytes(signed_nonce, payload)?;
    match String::from_utf8(raw) {
        Ok(text) => Ok(text),
        Err(err) => {
            let mut inflated = String::new();
            let mut decoder = GzDecoder::new(err.as_bytes());
            decoder
                .read_to_string(&mut inflated)
                .map_err(|_| CipherError::Garbled)?;
            Ok(inflated)
        }
    }
}

/// 按抓包数据的原始字段解密：先从 ssecurity 与 nonce 派生密钥再解密。
pub fn decrypt_with_nonce(
    ssecurity: &str,
    nonce: &str,
    payload: &str,
) -> Result<String, CipherError> {
    let signed = crate::sign::signed_nonce(ssecurity, nonce)?;
    decrypt(&signed, payload)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use flate2::{Compression, write::GzEncoder};
    use rc4::StreamCipher;

    use super::{CipherError, decrypt, decrypt_bytes, decrypt_with_nonce, encrypt};
    use crate::sign::signed_nonce;

    const SECRET: &str = "TGV0c1Rlc3RTU2VjdXJpdHkwMDE=";
    const NONCE: &str = "q8L5a0QjT2sAAAGS";

    fn test_key() -> String {
        signed_nonce(SECRET, NONCE).unwrap()
    }

    #[test]
    fn roundtrip_restores_plaintext() {
        let key = test_key();
        for plaintext in ["", "ok", r#"{"code":0,"result":[{"value":true}]}"#, "中文负载"] {
            let encrypted = encrypt(&key, plaintext).unwrap();
            assert_eq!(decrypt(&key, &encrypted).unwrap(), plaintext);
        }
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let key = test_key();
        let encrypted = encrypt(&key, "hello").unwrap();
        assert_ne!(STANDARD.decode(encrypted).unwrap(), b"hello");
    }

    #[test]
    fn gzip_payload_is_inflated_transparently() {
        let key = test_key();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all("压缩后的响应体".as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        // 手工构造"密文 = gzip 字节流"的响应：解出来不是 UTF-8，应自动解压。
        let mut buf = compressed.clone();
        super::primed_rc4(&key).unwrap().apply_keystream(&mut buf);
        let payload = STANDARD.encode(buf);
        assert_eq!(decrypt(&key, &payload).unwrap(), "压缩后的响应体");
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let err = decrypt_bytes("c2hvcnQ=", "AAAA").unwrap_err();
        assert!(matches!(err, CipherError::KeyLength(5)));
    }

    #[test]
    fn decrypt_with_nonce_matches_two_step_derivation() {
        let key = test_key();
        let encrypted = encrypt(&key, "payload").unwrap();
        assert_eq!(
            decrypt_with_nonce(SECRET, NONCE, &encrypted).unwrap(),
            "payload"
        );
    }
}
