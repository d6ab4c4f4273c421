//! 规格解析模块职责：
//! 1. 按 model 拉取目录页，从 `data-page` 属性还原 HTML 转义的内嵌 JSON。
//! 2. 把 services → properties/actions 展开为带类型/范围/枚举约束的描述符。
//! 3. 跨服务同名属性/动作按遍历顺序用所属服务名前缀消歧；结果可落盘缓存。

use std::{collections::BTreeMap, fs, path::PathBuf, time::Duration};

use mjc_shared_protocol::{
    SPEC_URL,
    miot::{Access, ActionDescriptor, DeviceSpec, PropertyDescriptor, ValueRange, ValueType},
};
use regex::Regex;
use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Error, Result};

/// 目录页请求超时。
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// 规格解析器；可选挂接缓存，命中时不再访问目录。
pub struct SpecResolver {
    http: Client,
    store: Option<SpecStore>,
}

impl SpecResolver {
    pub fn new(store: Option<SpecStore>) -> Result<Self> {
        let http = Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self { http, store })
    }

    /// 解析一个 model 的完整规格：缓存优先，未命中则在线拉取并回填。
    pub fn resolve(&self, model: &str) -> Result<DeviceSpec> {
        if let Some(store) = &self.store
            && let Some(spec) = store.load(model)
        {
            debug!("规格缓存命中: {model}");
            return Ok(spec);
        }
        let spec = self.fetch(model)?;
        if let Some(store) = &self.store {
            store.save(model, &spec);
        }
        Ok(spec)
    }

    fn fetch(&self, model: &str) -> Result<DeviceSpec> {
        let url = format!("{SPEC_URL}/{model}");
        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|err| spec_error(model, format!("请求目录页失败: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(spec_error(model, format!("目录页返回 HTTP {status}")));
        }
        let html = response
            .text()
            .map_err(|err| spec_error(model, format!("读取目录页失败: {err}")))?;
        parse_spec_page(model, &html)
    }
}

/// 从目录页 HTML 中解析设备规格；任何缺失或畸形都整体失败，不产出部分规格。
pub fn parse_spec_page(model: &str, html: &str) -> Result<DeviceSpec> {
    let pattern = Regex::new(r#"data-page="(.*?)""#).expect("正则字面量合法");
    let captured = pattern
        .captures(html)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| spec_error(model, "页面中没有 data-page 数据".to_string()))?;

    let decoded = html_escape::decode_html_entities(captured.as_str());
    let page: Value = serde_json::from_str(&decoded)
        .map_err(|err| spec_error(model, format!("内嵌 JSON 解析失败: {err}")))?;

    let props = &page["props"];
    let name = props["product"]["name"]
        .as_str()
        .unwrap_or(model)
        .to_string();
    let services = props["spec"]["services"]
        .as_array()
        .ok_or_else(|| spec_error(model, "规格缺少 services 列表".to_string()))?;

    let mut properties: BTreeMap<String, PropertyDescriptor> = BTreeMap::new();
    let mut actions: BTreeMap<String, ActionDescriptor> = BTreeMap::new();

    for service in services {
        let Some(siid) = service["iid"].as_u64() else {
            continue;
        };
        let service_name = urn_name(service["type"].as_str().unwrap_or_default())
            .unwrap_or("service")
            .to_string();

        for prop in service["properties"].as_array().map_or(&[][..], |v| v.as_slice()) {
            let Some(piid) = prop["iid"].as_u64() else {
                continue;
            };
            let base_name = urn_name(prop["type"].as_str().unwrap_or_default())
                .ok_or_else(|| spec_error(model, format!("属性 {siid}/{piid} 缺少类型 URN")))?;
            let format = prop["format"]
                .as_str()
                .ok_or_else(|| spec_error(model, format!("属性 '{base_name}' 缺少 format")))?;
            let value_type = ValueType::from_format(format).ok_or_else(|| {
                spec_error(model, format!("属性 '{base_name}' 的 format 不受支持: {format}"))
            })?;

            let flags = prop["access"].as_array().map_or(&[][..], |v| v.as_slice());
            let read = flags.iter().any(|flag| flag == "read");
            let write = flags.iter().any(|flag| flag == "write");
            // 仅可订阅（notify）的属性对读写访问器没有意义。
            let Some(access) = Access::from_flags(read, write) else {
                continue;
            };

            let range = prop["value-range"].as_array().and_then(parse_range);
            let enum_values = prop["value-list"]
                .as_array()
                .map(|entries| {
                    entries
                        .iter()
                        .map(|entry| entry["value"].clone())
                        .collect::<Vec<Value>>()
                })
                .unwrap_or_default();

            let name = dedupe_name(&properties, base_name, &service_name);
            let descriptor = PropertyDescriptor {
                name: name.clone(),
                description: prop["description"].as_str().unwrap_or_default().to_string(),
                value_type,
                access,
                unit: prop["unit"].as_str().map(str::to_string),
                range,
                enum_values,
                siid,
                piid,
            };
            let _ = properties.insert(name, descriptor);
        }

        for action in service["actions"].as_array().map_or(&[][..], |v| v.as_slice()) {
            let Some(aiid) = action["iid"].as_u64() else {
                continue;
            };
            let base_name = urn_name(action["type"].as_str().unwrap_or_default())
                .ok_or_else(|| spec_error(model, format!("动作 {siid}/{aiid} 缺少类型 URN")))?;
            let name = dedupe_name(&actions, base_name, &service_name);
            let descriptor = ActionDescriptor {
                name: name.clone(),
                description: action["description"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                siid,
                aiid,
            };
            let _ = actions.insert(name, descriptor);
        }
    }

    Ok(DeviceSpec {
        name,
        model: model.to_string(),
        properties,
        actions,
    })
}

/// 先见者保留裸名，后来者加所属服务名前缀。
fn dedupe_name<T>(existing: &BTreeMap<String, T>, base: &str, service_name: &str) -> String {
    if existing.contains_key(base) {
        format!("{service_name}-{base}")
    } else {
        base.to_string()
    }
}

/// 从 miot 类型 URN 中取能力名（第 4 段）。
fn urn_name(urn: &str) -> Option<&str> {
    urn.split(':').nth(3).filter(|segment| !segment.is_empty())
}

/// 解析 `value-range`：[min, max] 或 [min, max, step]。
fn parse_range(entries: &Vec<Value>) -> Option<ValueRange> {
    let min = entries.first()?.as_f64()?;
    let max = entries.get(1)?.as_f64()?;
    let step = entries.get(2).and_then(Value::as_f64);
    Some(ValueRange { min, max, step })
}

fn spec_error(model: &str, reason: String) -> Error {
    Error::GetDeviceInfo {
        model: model.to_string(),
        reason,
    }
}

/// 规格缓存：model 为键的 JSON 文件目录，条目一经写入不再改写。
pub struct SpecStore {
    dir: PathBuf,
}

impl SpecStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn entry_path(&self, model: &str) -> PathBuf {
        self.dir.join(format!("{model}.json"))
    }

    /// 读取缓存条目；损坏时告警并按未命中处理。
    pub fn load(&self, model: &str) -> Option<DeviceSpec> {
        let raw = fs::read_to_string(self.entry_path(model)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(spec) => Some(spec),
            Err(err) => {
                warn!("规格缓存损坏，忽略 {model}: {err}");
                None
            }
        }
    }

    /// 写入缓存条目；已存在的条目不可变，直接跳过。
    pub fn save(&self, model: &str, spec: &DeviceSpec) {
        let path = self.entry_path(model);
        if path.exists() {
            return;
        }
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!("创建规格缓存目录失败: {err}");
            return;
        }
        let payload = match serde_json::to_string_pretty(spec) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("序列化规格失败: {err}");
                return;
            }
        };
        if let Err(err) = fs::write(&path, format!("{payload}\n")) {
            warn!("写入规格缓存失败: {err}");
        }
    }
}
