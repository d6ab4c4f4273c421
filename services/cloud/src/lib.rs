//! 米家云端客户端库职责：
//! 1. 管理登录会话（账号密码 / 扫码），独占凭证的修改与落盘。
//! 2. 通过签名（可选加密）链路调用云端接口。
//! 3. 解析设备能力规格，并提供带本地校验与节流的属性/动作访问器。

pub mod apis;
pub mod cli;
pub mod config;
pub mod device;
pub mod errors;
pub mod logging;
pub mod session;
pub mod spec;
pub mod transport;

pub use apis::{CloudApi, MiotBackend};
pub use device::Device;
pub use errors::{Error, Result};
pub use session::SessionManager;
pub use spec::SpecResolver;
pub use transport::{Transport, WireProtocol};
