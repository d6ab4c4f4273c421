//! 错误类型模块职责：
//! 1. 以单一枚举承载登录/传输/设备/校验各类失败，调用方可直接分支。
//! 2. 设备类错误自带设备名、属性/动作名与返回码的固定文案映射。
//! 3. 校验与命名错误在发起任何网络调用之前产生，绝不重试。

use mjc_shared_protocol::codes;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// 登录/扫码/刷新链路失败；超时固定使用 code -1。
    #[error("登录失败, code: {code}, message: {message}")]
    Login { code: i64, message: String },

    /// API 响应信封返回非零 code。
    #[error("请求失败, code: {code}, message: {message}")]
    Api { code: i64, message: String },

    /// 按名称或 did 未匹配到任何设备。
    #[error("未找到名称或 did 为 '{0}' 的设备，请检查输入是否正确")]
    DeviceNotFound(String),

    /// 名称命中多台设备，需要改用 did。
    #[error("{0}")]
    MultipleDevicesFound(String),

    /// 规格页拉取或解析失败，不返回部分规格。
    #[error("获取设备型号 '{model}' 的规格信息失败: {reason}")]
    GetDeviceInfo { model: String, reason: String },

    #[error(
        "获取设备 '{device}' 的属性 '{name}' 时失败, code: {code}, message: {}",
        codes::describe_or_unknown(*.code)
    )]
    DeviceGet {
        device: String,
        name: String,
        code: i64,
    },

    #[error(
        "设置设备 '{device}' 的属性 '{name}' 时失败, code: {code}, message: {}",
        codes::describe_or_unknown(*.code)
    )]
    DeviceSet {
        device: String,
        name: String,
        code: i64,
    },

    #[error(
        "执行设备 '{device}' 的动作 '{name}' 时失败, code: {code}, message: {}",
        codes::describe_or_unknown(*.code)
    )]
    DeviceAction {
        device: String,
        name: String,
        code: i64,
    },

    /// 本地类型/范围/枚举/读写权限校验失败。
    #[error("{0}")]
    Validation(String),

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON 解析失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base64 解码失败: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("加解密失败: {0}")]
    Cipher(#[from] mjc_shared_protocol::cipher::CipherError),

    #[error("IO 失败: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// 设备类错误的返回码（含 Api），便于调用方按码分支。
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Login { code, .. }
            | Self::Api { code, .. }
            | Self::DeviceGet { code, .. }
            | Self::DeviceSet { code, .. }
            | Self::DeviceAction { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn device_errors_resolve_code_table_text() {
        let err = Error::DeviceGet {
            device: "台灯".to_string(),
            name: "on".to_string(),
            code: -704042011,
        };
        let text = err.to_string();
        assert!(text.contains("设备离线"), "unexpected message: {text}");
        assert!(text.contains("'台灯'"));
        assert!(text.contains("'on'"));
    }

    #[test]
    fn unlisted_device_code_reads_unknown() {
        let err = Error::DeviceSet {
            device: "d".to_string(),
            name: "p".to_string(),
            code: 42,
        };
        assert!(err.to_string().contains("未知错误"));
    }

    #[test]
    fn code_accessor_exposes_numeric_code() {
        let err = Error::Api {
            code: -10007,
            message: "x".to_string(),
        };
        assert_eq!(err.code(), Some(-10007));
        assert_eq!(Error::Validation("v".to_string()).code(), None);
    }
}
