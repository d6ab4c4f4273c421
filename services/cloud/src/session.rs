//! 会话管理模块职责：
//! 1. 承载登录状态机：账号密码登录、扫码登录、可用性判定与一次机会式刷新。
//! 2. 独占登录凭证（AuthPayload）的修改；成功登录/刷新即整文件原子覆盖落盘。
//! 3. 会话过期时间取跳转响应中最晚的 GMT cookie 过期戳，仅作提示值。

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use md5::{Digest, Md5};
use mjc_shared_protocol::{
    AuthPayload, DEFAULT_UA, INDEX_URL, LOGIN_URL, QR_URL, SDK_VERSION, parse_prefixed,
};
use rand::{Rng, distributions::Alphanumeric};
use reqwest::{
    blocking::Client,
    header::{ACCEPT, CONNECTION, COOKIE, LOCATION, SET_COOKIE, USER_AGENT},
    redirect::Policy,
};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::errors::{Error, Result};

/// 登录链路通用请求超时。
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// 扫码长轮询超时；到时即终止并要求重试，不做静默回退。
const QR_POLL_TIMEOUT: Duration = Duration::from_secs(60);
/// 登录跳转链最大深度。
const MAX_REDIRECTS: usize = 5;
/// 凭证持久化与可用性判定使用的时间格式（本地时区）。
const EXPIRE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 会话状态机。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
    Refreshing,
}

/// 会话管理器：唯一允许修改与持久化登录凭证的组件。
pub struct SessionManager {
    http: Client,
    auth_path: PathBuf,
    device_id: String,
    auth: Option<AuthPayload>,
    state: SessionState,
}

impl SessionManager {
    /// 绑定认证文件创建管理器；文件存在且字段齐备时直接进入已登录态。
    pub fn with_auth_file(auth_path: PathBuf) -> Result<Self> {
        // 登录跳转需要逐跳读取 Set-Cookie，重定向改为手工跟随。
        let http = Client::builder()
            .cookie_store(true)
            .redirect(Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let mut manager = Self {
            http,
            auth_path,
            device_id: random_device_id(),
            auth: None,
            state: SessionState::Unauthenticated,
        };
        manager.load_auth_file();
        Ok(manager)
    }

    /// 当前凭证（只读）。
    pub fn session(&self) -> Option<&AuthPayload> {
        self.auth.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn auth_path(&self) -> &Path {
        &self.auth_path
    }

    /// 账号密码登录。需要安全验证的账号会被拒绝并提示改用扫码。
    pub fn login(&mut self, username: &str, password: &str) -> Result<&AuthPayload> {
        self.state = SessionState::Authenticating;
        match self.login_inner(username, password) {
            Ok(()) => Ok(self.auth.as_ref().expect("login_inner 成功后必有凭证")),
            Err(err) => {
                self.state = SessionState::Unauthenticated;
                Err(err)
            }
        }
    }

    fn login_inner(&mut self, username: &str, password: &str) -> Result<()> {
        let index = self.fetch_index()?;
        let qs = require_str(&index, "qs")?;
        let sign = require_str(&index, "_sign")?;
        let callback = require_str(&index, "callback")?;

        let hash = password_hash(password);
        let form = [
            ("qs", qs),
            ("_sign", sign),
            ("callback", callback),
            ("sid", "xiaomiio"),
            ("_json", "true"),
            ("user", username),
            ("hash", hash.as_str()),
        ];
        let response = self
            .http
            .post(LOGIN_URL)
            .header(USER_AGENT, DEFAULT_UA)
            .header(COOKIE, self.device_cookie())
            .form(&form)
            .send()?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(Error::Login {
                code: i64::from(status.as_u16()),
                message: format!("提交登录请求失败: HTTP {status}"),
            });
        }

        let data = parse_prefixed(&text)?;
        let code = data["code"].as_i64().unwrap_or(-1);
        if code != 0 {
            return Err(Error::Login {
                code,
                message: data["desc"].as_str().unwrap_or("登录失败").to_string(),
            });
        }
        if data.get("notificationUrl").is_some_and(|value| !value.is_null()) {
            return Err(Error::Login {
                code: -1,
                message: "账号触发安全验证，请改用扫码登录".to_string(),
            });
        }
        let location = data["location"]
            .as_str()
            .ok_or_else(|| Error::Login {
                code: -1,
                message: "登录响应缺少跳转地址".to_string(),
            })?
            .to_string();
        self.finish_login(&data, &location)
    }

    /// 扫码登录：签发二维码地址交给 `render` 展示，随后长轮询等待确认。
    pub fn login_qr(&mut self, render: &mut dyn FnMut(&str)) -> Result<&AuthPayload> {
        self.state = SessionState::Authenticating;
        match self.login_qr_inner(render) {
            Ok(()) => Ok(self.auth.as_ref().expect("login_qr_inner 成功后必有凭证")),
            Err(err) => {
                self.state = SessionState::Unauthenticated;
                Err(err)
            }
        }
    }

    fn login_qr_inner(&mut self, render: &mut dyn FnMut(&str)) -> Result<()> {
        let index = self.fetch_index()?;
        let qs = require_str(&index, "qs")?;
        let sign = require_str(&index, "_sign")?;
        let callback = require_str(&index, "callback")?;
        let location = require_str(&index, "location")?;

        let service_param = Url::parse(location)
            .ok()
            .and_then(|parsed| {
                parsed
                    .query_pairs()
                    .find(|(key, _)| key == "serviceParam")
                    .map(|(_, value)| value.into_owned())
            })
            .unwrap_or_default();

        let dc = unix_millis().to_string();
        let query = [
            ("_qrsize", "240"),
            ("qs", qs),
            ("bizDeviceType", ""),
            ("callback", callback),
            ("_json", "true"),
            ("theme", ""),
            ("sid", "xiaomiio"),
            ("needTheme", "false"),
            ("showActiveX", "false"),
            ("serviceParam", service_param.as_str()),
            ("_local", "zh_CN"),
            ("_sign", sign),
            ("_dc", dc.as_str()),
        ];
        let response = self
            .http
            .get(QR_URL)
            .query(&query)
            .header(USER_AGENT, DEFAULT_UA)
            .header(COOKIE, self.device_cookie())
            .send()?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(Error::Login {
                code: i64::from(status.as_u16()),
                message: format!("签发二维码失败: HTTP {status}"),
            });
        }
        let data = parse_prefixed(&text)?;
        let code = data["code"].as_i64().unwrap_or(-1);
        if code != 0 {
            return Err(Error::Login {
                code,
                message: data["desc"].as_str().unwrap_or("签发二维码失败").to_string(),
            });
        }
        let login_url = require_str(&data, "loginUrl")?;
        let long_poll = require_str(&data, "lp")?.to_string();
        render(login_url);

        info!("等待米家 APP 扫码确认（{} 秒内有效）", QR_POLL_TIMEOUT.as_secs());
        let response = match self
            .http
            .get(&long_poll)
            .header(USER_AGENT, DEFAULT_UA)
            .header(CONNECTION, "keep-alive")
            .timeout(QR_POLL_TIMEOUT)
            .send()
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Err(Error::Login {
                    code: -1,
                    message: "等待扫码确认超时，请重试".to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(Error::Login {
                code: i64::from(status.as_u16()),
                message: format!("等待扫码确认失败: HTTP {status}"),
            });
        }
        let data = parse_prefixed(&text)?;
        let code = data["code"].as_i64().unwrap_or(-1);
        if code != 0 {
            return Err(Error::Login {
                code,
                message: data["desc"].as_str().unwrap_or("扫码登录失败").to_string(),
            });
        }
        let location = require_str(&data, "location")?.to_string();
        self.finish_login(&data, &location)
    }

    /// 可用性判定：签名字段齐备且过期提示在未来；纯本地，不发请求。
    pub fn available(&self) -> bool {
        let Some(auth) = &self.auth else {
            return false;
        };
        if !auth.is_complete() {
            return false;
        }
        let Some(expire) = &auth.expire_time else {
            return false;
        };
        let Ok(stamp) = NaiveDateTime::parse_from_str(expire, EXPIRE_FORMAT) else {
            return false;
        };
        stamp > Local::now().naive_local()
    }

    /// 服务端可用性探测：本地判定之外再发一次轻量调用验证是否被吊销。
    pub fn probe(&self, transport: &crate::transport::Transport) -> bool {
        if !self.available() {
            return false;
        }
        let Some(auth) = &self.auth else {
            return false;
        };
        transport
            .call(
                auth,
                "/v2/homeroom/gethome",
                &serde_json::json!({
                    "fg": false,
                    "fetch_share": false,
                    "fetch_share_dev": false,
                    "limit": 1,
                    "app_ver": 7,
                }),
            )
            .is_ok()
    }

    /// 机会式刷新：带现有 cookie 重取登录索引，服务端仍认可会话时原地换新
    /// ssecurity/serviceToken；否则退回未登录态等待重新登录。只尝试一次。
    pub fn refresh(&mut self) -> Result<bool> {
        let Some(current) = self.auth.clone() else {
            self.state = SessionState::Unauthenticated;
            return Ok(false);
        };
        self.state = SessionState::Refreshing;

        let data = match self.fetch_index() {
            Ok(data) => data,
            Err(err) => {
                warn!("会话刷新探测失败: {err}");
                self.state = SessionState::Unauthenticated;
                return Ok(false);
            }
        };
        let code = data["code"].as_i64().unwrap_or(-1);
        let (Some(ssecurity), Some(location)) =
            (data["ssecurity"].as_str(), data["location"].as_str())
        else {
            self.state = SessionState::Unauthenticated;
            return Ok(false);
        };
        if code != 0 {
            self.state = SessionState::Unauthenticated;
            return Ok(false);
        }

        let location = location.to_string();
        let ssecurity = ssecurity.to_string();
        let (token, expire_time) = match self.follow_redirects(&location) {
            Ok(collected) => collected,
            Err(err) => {
                warn!("会话刷新跳转失败: {err}");
                self.state = SessionState::Unauthenticated;
                return Ok(false);
            }
        };
        let Some(service_token) = token else {
            self.state = SessionState::Unauthenticated;
            return Ok(false);
        };

        let mut updated = current;
        updated.ssecurity = ssecurity;
        updated.service_token = service_token;
        updated.expire_time = expire_time;
        if let Some(user_id) = data["userId"].as_i64() {
            updated.user_id = user_id;
        }
        self.persist(&updated)?;
        self.auth = Some(updated);
        self.state = SessionState::Authenticated;
        info!("会话刷新成功");
        Ok(true)
    }

    /// 确保凭证可用：本地判定失败时做一次刷新，仍失败则要求重新登录。
    /// 过期但仍被服务端认可、未过期但已被吊销，两种情况都走同一条路径。
    pub fn ensure_available(&mut self) -> Result<&AuthPayload> {
        if self.available() {
            self.state = SessionState::Authenticated;
            return Ok(self.auth.as_ref().expect("available 蕴含凭证存在"));
        }
        if self.auth.is_some() {
            self.state = SessionState::Expired;
            if self.refresh()? {
                return Ok(self.auth.as_ref().expect("refresh 成功后必有凭证"));
            }
        }
        Err(Error::Login {
            code: -1,
            message: "登录凭证缺失或已失效，请重新登录".to_string(),
        })
    }

    /// 获取登录索引参数；响应带固定前缀。
    fn fetch_index(&self) -> Result<Value> {
        let response = self
            .http
            .get(INDEX_URL)
            .header(USER_AGENT, DEFAULT_UA)
            .header(ACCEPT, "*/*")
            .header(COOKIE, self.device_cookie())
            .send()?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(Error::Login {
                code: i64::from(status.as_u16()),
                message: format!("获取登录索引失败: HTTP {status}"),
            });
        }
        Ok(parse_prefixed(&text)?)
    }

    /// 登录/刷新共用的收尾：跟随跳转收集 serviceToken 与过期戳，组装并落盘。
    fn finish_login(&mut self, data: &Value, location: &str) -> Result<()> {
        let user_id = data["userId"].as_i64().ok_or_else(|| Error::Login {
            code: -1,
            message: "登录响应缺少 userId".to_string(),
        })?;
        let ssecurity = require_str(data, "ssecurity")?.to_string();

        let (token, expire_time) = self.follow_redirects(location)?;
        let service_token = token.ok_or_else(|| Error::Login {
            code: -1,
            message: "登录跳转后未获得 serviceToken".to_string(),
        })?;

        let auth = AuthPayload {
            user_id,
            device_id: self.device_id.clone(),
            ssecurity,
            service_token,
            expire_time,
            c_user_id: data["cUserId"].as_str().map(str::to_string),
            locale: None,
            ua: Some(DEFAULT_UA.to_string()),
        };
        self.persist(&auth)?;
        self.auth = Some(auth);
        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// 手工跟随登录跳转链，逐跳收集 serviceToken cookie 与最晚过期戳。
    fn follow_redirects(&self, location: &str) -> Result<(Option<String>, Option<String>)> {
        let mut url = location.to_string();
        let mut service_token: Option<String> = None;
        let mut latest_expiry: Option<DateTime<Utc>> = None;

        for _ in 0..MAX_REDIRECTS {
            let response = self
                .http
                .get(&url)
                .header(USER_AGENT, DEFAULT_UA)
                .send()?;

            for header in response.headers().get_all(SET_COOKIE) {
                let Ok(raw) = header.to_str() else { continue };
                if let Some(value) = cookie_value(raw, "serviceToken")
                    && !value.is_empty()
                {
                    service_token = Some(value);
                }
                if let Some(stamp) = cookie_expiry(raw) {
                    latest_expiry = Some(match latest_expiry {
                        Some(current) => current.max(stamp),
                        None => stamp,
                    });
                }
            }

            if response.status().is_redirection() {
                let Some(next) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                else {
                    break;
                };
                url = resolve_redirect(&url, next)?;
                continue;
            }
            if !response.status().is_success() {
                return Err(Error::Login {
                    code: i64::from(response.status().as_u16()),
                    message: format!("登录跳转失败: HTTP {}", response.status()),
                });
            }
            break;
        }

        let expire_time = latest_expiry
            .map(|stamp| stamp.with_timezone(&Local).format(EXPIRE_FORMAT).to_string());
        Ok((service_token, expire_time))
    }

    /// 登录索引 cookie：本地设备标识与 SDK 版本。
    fn device_cookie(&self) -> String {
        format!("deviceId={}; sdkVersion={}", self.device_id, SDK_VERSION)
    }

    /// 读取认证文件；不完整或损坏时忽略并保持未登录态。
    fn load_auth_file(&mut self) {
        if !self.auth_path.exists() {
            return;
        }
        let raw = match fs::read_to_string(&self.auth_path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("读取认证文件失败: {err}");
                return;
            }
        };
        match serde_json::from_str::<AuthPayload>(&raw) {
            Ok(auth) if auth.is_complete() => {
                self.device_id = auth.device_id.clone();
                self.auth = Some(auth);
                self.state = SessionState::Authenticated;
            }
            Ok(_) => warn!("认证文件签名字段不完整，忽略: {}", self.auth_path.display()),
            Err(err) => warn!("解析认证文件失败: {err}"),
        }
    }

    /// 凭证落盘：临时文件写入后重命名，整文件原子覆盖。
    fn persist(&self, auth: &AuthPayload) -> Result<()> {
        if let Some(parent) = self.auth_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(auth)?;
        let staging = self.auth_path.with_extension("json.tmp");
        fs::write(&staging, format!("{payload}\n"))?;
        fs::rename(&staging, &self.auth_path)?;
        info!("登录凭证已保存: {}", self.auth_path.display());
        Ok(())
    }
}

/// 从登录链路响应 JSON 中取必需的字符串字段。
fn require_str<'v>(data: &'v Value, key: &str) -> Result<&'v str> {
    data[key].as_str().ok_or_else(|| Error::Login {
        code: -1,
        message: format!("登录响应缺少 {key} 字段"),
    })
}

/// 生成 16 位字母数字设备标识。
fn random_device_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// 登录口令散列：MD5 十六进制大写。
fn password_hash(password: &str) -> String {
    let digest = Md5::digest(password.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{byte:02X}");
    }
    out
}

/// 从 Set-Cookie 原文中取指定 cookie 的值。
fn cookie_value(raw: &str, name: &str) -> Option<String> {
    let first = raw.split(';').next()?;
    let (key, value) = first.split_once('=')?;
    if key.trim() != name {
        return None;
    }
    Some(value.trim().to_string())
}

/// 从 Set-Cookie 原文中解析 `expires=` 属性；两种 GMT 写法都接受。
fn cookie_expiry(raw: &str) -> Option<DateTime<Utc>> {
    for segment in raw.split(';') {
        let trimmed = segment.trim();
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("expires") {
            continue;
        }
        let value = value.trim();
        for format in ["%a, %d-%b-%Y %H:%M:%S GMT", "%a, %d %b %Y %H:%M:%S GMT"] {
            if let Ok(stamp) = NaiveDateTime::parse_from_str(value, format) {
                return Some(Utc.from_utc_datetime(&stamp));
            }
        }
    }
    None
}

/// 解析跳转地址；支持相对 Location。
fn resolve_redirect(base: &str, next: &str) -> Result<String> {
    let parsed = Url::parse(base)
        .and_then(|base_url| base_url.join(next))
        .map_err(|err| Error::Login {
            code: -1,
            message: format!("登录跳转地址无效: {err}"),
        })?;
    Ok(parsed.to_string())
}

/// 当前 Unix 毫秒数。
fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeZone, Utc};

    use super::{
        SessionManager, SessionState, cookie_expiry, cookie_value, password_hash,
        random_device_id, resolve_redirect,
    };

    fn temp_auth_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("mjc-session-{tag}-{}.json", std::process::id()))
    }

    #[test]
    fn password_hash_matches_reference_vector() {
        assert_eq!(password_hash("test"), "098F6BCD4621D373CADE4E832627B4F6");
        assert_eq!(password_hash("test").len(), 32);
    }

    #[test]
    fn device_id_is_sixteen_alphanumerics() {
        let id = random_device_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn cookie_value_reads_first_pair_only() {
        let raw = "serviceToken=abc123; Path=/; Expires=Thu, 14-Aug-2025 09:00:00 GMT";
        assert_eq!(cookie_value(raw, "serviceToken").unwrap(), "abc123");
        assert!(cookie_value(raw, "userId").is_none());
    }

    #[test]
    fn cookie_expiry_accepts_both_gmt_layouts() {
        let dashed = "x=1; expires=Thu, 14-Aug-2025 09:00:00 GMT";
        let spaced = "x=1; Expires=Thu, 14 Aug 2025 09:00:00 GMT";
        let expected = Utc.with_ymd_and_hms(2025, 8, 14, 9, 0, 0).unwrap();
        assert_eq!(cookie_expiry(dashed).unwrap(), expected);
        assert_eq!(cookie_expiry(spaced).unwrap(), expected);
        assert!(cookie_expiry("x=1; Path=/").is_none());
    }

    #[test]
    fn missing_auth_file_starts_unauthenticated() {
        let manager = SessionManager::with_auth_file(temp_auth_path("missing")).unwrap();
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(manager.session().is_none());
        assert!(!manager.available());
    }

    #[test]
    fn expired_session_is_unavailable_without_network() {
        let path = temp_auth_path("expired");
        let auth = r#"{
            "userId": 42,
            "deviceId": "abcdef0123456789",
            "ssecurity": "c2VjcmV0",
            "serviceToken": "tok",
            "expireTime": "2000-01-01 00:00:00"
        }"#;
        std::fs::write(&path, auth).unwrap();
        let manager = SessionManager::with_auth_file(path.clone()).unwrap();
        assert_eq!(manager.state(), SessionState::Authenticated);
        assert!(!manager.available());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn session_without_expire_hint_is_unavailable() {
        let path = temp_auth_path("no-expiry");
        let auth = r#"{
            "userId": 42,
            "deviceId": "abcdef0123456789",
            "ssecurity": "c2VjcmV0",
            "serviceToken": "tok"
        }"#;
        std::fs::write(&path, auth).unwrap();
        let manager = SessionManager::with_auth_file(path.clone()).unwrap();
        assert!(!manager.available());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn future_expire_hint_is_available() {
        let path = temp_auth_path("future");
        let future = (Local::now() + chrono::Duration::hours(1))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let auth = format!(
            r#"{{
                "userId": 42,
                "deviceId": "abcdef0123456789",
                "ssecurity": "c2VjcmV0",
                "serviceToken": "tok",
                "expireTime": "{future}"
            }}"#
        );
        std::fs::write(&path, auth).unwrap();
        let manager = SessionManager::with_auth_file(path.clone()).unwrap();
        assert!(manager.available());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn redirect_resolution_handles_relative_location() {
        let next = resolve_redirect("https://account.example.com/pass/login", "/sts?d=1").unwrap();
        assert_eq!(next, "https://account.example.com/sts?d=1");
        let absolute =
            resolve_redirect("https://account.example.com/x", "https://sts.example.com/ok")
                .unwrap();
        assert_eq!(absolute, "https://sts.example.com/ok");
    }
}
