//! 设备访问模块职责：
//! 1. 以描述符表驱动属性读写与动作执行，按 did/siid/piid/aiid 路由。
//! 2. 写入前做纯本地的类型/范围/步进/枚举校验，不通过不发任何网络请求。
//! 3. 每次成功调用后强制节流等待：远端属性缓存是最终一致的，
//!    立即回读会拿到旧值，这个等待属于调用契约而不是限流礼让。

use std::{fmt, thread, time::Duration};

use mjc_shared_protocol::miot::{ActionDescriptor, DeviceSpec, PropertyDescriptor, ValueType};
use serde_json::Value;
use tracing::debug;

use crate::{
    apis::{ActionRequest, DeviceInfo, MiotBackend, PropRequest, PropSetRequest},
    errors::{Error, Result},
};

/// 设备句柄：绑定一台设备的路由信息与能力规格，描述符只读。
pub struct Device<'a> {
    backend: &'a dyn MiotBackend,
    info: DeviceInfo,
    spec: DeviceSpec,
    pacing: Duration,
}

impl<'a> Device<'a> {
    pub fn new(
        backend: &'a dyn MiotBackend,
        info: DeviceInfo,
        spec: DeviceSpec,
        pacing: Duration,
    ) -> Self {
        Self {
            backend,
            info,
            spec,
            pacing,
        }
    }

    pub fn did(&self) -> &str {
        &self.info.did
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    /// 读取属性值。
    pub fn get(&self, prop_name: &str) -> Result<Value> {
        let prop = self.property(prop_name)?;
        if !prop.access.readable() {
            return Err(Error::Validation(format!(
                "属性 '{prop_name}' 只写，不能读取"
            )));
        }

        let request = PropRequest {
            did: self.info.did.clone(),
            siid: prop.siid,
            piid: prop.piid,
        };
        let status = self
            .backend
            .get_properties(&[request])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::DeviceGet {
                device: self.info.name.clone(),
                name: prop_name.to_string(),
                code: -1,
            })?;
        if status.code != 0 {
            return Err(Error::DeviceGet {
                device: self.info.name.clone(),
                name: prop_name.to_string(),
                code: status.code,
            });
        }
        let value = status.value.unwrap_or(Value::Null);
        debug!("get {}#{prop_name} -> {value}", self.info.name);
        self.pace();
        Ok(value)
    }

    /// 写入属性值；取值先经本地校验与类型收敛。
    pub fn set(&self, prop_name: &str, value: &Value) -> Result<()> {
        let prop = self.property(prop_name)?;
        if !prop.access.writable() {
            return Err(Error::Validation(format!(
                "属性 '{prop_name}' 只读，不能写入"
            )));
        }
        let coerced = coerce_value(prop, value)?;

        let request = PropSetRequest {
            did: self.info.did.clone(),
            siid: prop.siid,
            piid: prop.piid,
            value: coerced,
        };
        let status = self
            .backend
            .set_properties(&[request])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::DeviceSet {
                device: self.info.name.clone(),
                name: prop_name.to_string(),
                code: -1,
            })?;
        if status.code != 0 {
            return Err(Error::DeviceSet {
                device: self.info.name.clone(),
                name: prop_name.to_string(),
                code: status.code,
            });
        }
        debug!("set {}#{prop_name} 完成", self.info.name);
        self.pace();
        Ok(())
    }

    /// 执行动作；`args` 缺省时请求体不带 value 键。
    pub fn run_action(
        &self,
        action_name: &str,
        args: Option<Vec<Value>>,
    ) -> Result<Option<Vec<Value>>> {
        let action = self.action(action_name)?;
        let request = ActionRequest {
            did: self.info.did.clone(),
            siid: action.siid,
            aiid: action.aiid,
            value: args,
        };
        let status = self.backend.run_action(&request)?;
        if status.code != 0 {
            return Err(Error::DeviceAction {
                device: self.info.name.clone(),
                name: action_name.to_string(),
                code: status.code,
            });
        }
        debug!("action {}#{action_name} 完成", self.info.name);
        self.pace();
        Ok(status.out)
    }

    fn property(&self, name: &str) -> Result<&PropertyDescriptor> {
        self.spec.properties.get(name).ok_or_else(|| {
            Error::Validation(format!(
                "不支持的属性 '{name}'，可用属性: {}",
                join_keys(self.spec.properties.keys())
            ))
        })
    }

    fn action(&self, name: &str) -> Result<&ActionDescriptor> {
        self.spec.actions.get(name).ok_or_else(|| {
            Error::Validation(format!(
                "不支持的动作 '{name}'，可用动作: {}",
                join_keys(self.spec.actions.keys())
            ))
        })
    }

    fn pace(&self) {
        if !self.pacing.is_zero() {
            thread::sleep(self.pacing);
        }
    }
}

impl fmt::Display for Device<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec)
    }
}

/// 在设备列表中按 did 或名称定位唯一一台设备。
pub fn find_device(devices: &[DeviceInfo], key: &str) -> Result<DeviceInfo> {
    if let Some(matched) = devices.iter().find(|device| device.did == key) {
        return Ok(matched.clone());
    }
    let mut named = devices.iter().filter(|device| device.name == key);
    let Some(first) = named.next() else {
        return Err(Error::DeviceNotFound(key.to_string()));
    };
    if named.next().is_some() {
        return Err(Error::MultipleDevicesFound(format!(
            "名称 '{key}' 命中多台设备，请改用 did 指定"
        )));
    }
    Ok(first.clone())
}

fn join_keys<'k>(keys: impl Iterator<Item = &'k String>) -> String {
    keys.map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// 按描述符收敛取值；任何违例立刻拒绝，从不取整或截断。
fn coerce_value(prop: &PropertyDescriptor, value: &Value) -> Result<Value> {
    match prop.value_type {
        ValueType::Bool => coerce_bool(prop, value),
        ValueType::Int | ValueType::Uint => {
            let parsed = coerce_integer(prop, value)?;
            Ok(Value::from(parsed))
        }
        ValueType::Float => {
            let parsed = coerce_float(prop, value)?;
            Ok(Value::from(parsed))
        }
        ValueType::String => match value {
            Value::String(_) => Ok(value.clone()),
            other => Err(Error::Validation(format!(
                "属性 '{}' 为 string 类型，拿到: {other}",
                prop.name
            ))),
        },
    }
}

/// bool 收敛：接受 true/false、字面串 "true"/"false"、0/1。
fn coerce_bool(prop: &PropertyDescriptor, value: &Value) -> Result<Value> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::String(text) if text == "true" => Ok(Value::Bool(true)),
        Value::String(text) if text == "false" => Ok(Value::Bool(false)),
        Value::Number(number) => match number.as_i64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(bool_error(prop, value)),
        },
        _ => Err(bool_error(prop, value)),
    }
}

fn bool_error(prop: &PropertyDescriptor, value: &Value) -> Error {
    Error::Validation(format!(
        "属性 '{}' 为 bool 类型，只接受 true/false、\"true\"/\"false\" 或 0/1，拿到: {value}",
        prop.name
    ))
}

/// 整数收敛：数字或数字串；uint 额外拒绝负值；随后套范围/步进/枚举。
fn coerce_integer(prop: &PropertyDescriptor, value: &Value) -> Result<i64> {
    let parsed = match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0)
                .map(|float| float as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        Error::Validation(format!(
            "属性 '{}' 需要 {} 整数值，拿到: {value}",
            prop.name,
            prop.value_type.label()
        ))
    })?;

    if prop.value_type == ValueType::Uint && parsed < 0 {
        return Err(Error::Validation(format!(
            "属性 '{}' 为 uint 类型，不接受负值: {parsed}",
            prop.name
        )));
    }
    check_range(prop, parsed as f64)?;
    check_enum(prop, &Value::from(parsed))?;
    Ok(parsed)
}

/// 浮点收敛：数字或数字串；随后套范围/步进/枚举。
fn coerce_float(prop: &PropertyDescriptor, value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        Error::Validation(format!(
            "属性 '{}' 需要 float 数值，拿到: {value}",
            prop.name
        ))
    })?;

    check_range(prop, parsed)?;
    check_enum(prop, &Value::from(parsed))?;
    Ok(parsed)
}

/// 范围校验：[min, max] 闭区间；声明了 step 时相对 min 的偏移必须整除。
fn check_range(prop: &PropertyDescriptor, value: f64) -> Result<()> {
    let Some(range) = prop.range else {
        return Ok(());
    };
    if value < range.min || value > range.max {
        return Err(Error::Validation(format!(
            "属性 '{}' 取值 {value} 超出范围 [{}, {}]",
            prop.name, range.min, range.max
        )));
    }
    if let Some(step) = range.step
        && step > 0.0
    {
        let ratio = (value - range.min) / step;
        if (ratio - ratio.round()).abs() > 1e-9 {
            return Err(Error::Validation(format!(
                "属性 '{}' 取值 {value} 不满足步进 {step}（从 {} 起）",
                prop.name, range.min
            )));
        }
    }
    Ok(())
}

/// 枚举校验：必须与声明值精确匹配。
fn check_enum(prop: &PropertyDescriptor, value: &Value) -> Result<()> {
    if prop.enum_values.is_empty() {
        return Ok(());
    }
    let matched = prop
        .enum_values
        .iter()
        .any(|allowed| value_equals(allowed, value));
    if !matched {
        return Err(Error::Validation(format!(
            "属性 '{}' 取值 {value} 不在枚举 {} 中",
            prop.name,
            Value::from(prop.enum_values.clone())
        )));
    }
    Ok(())
}

/// JSON 数值相等：同构直接比较，数字跨表示按数值比较。
fn value_equals(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a - b).abs() < 1e-9,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::BTreeMap, time::Duration};

    use mjc_shared_protocol::miot::{
        Access, ActionDescriptor, DeviceSpec, PropertyDescriptor, ValueRange, ValueType,
    };
    use serde_json::{Value, json};

    use super::{Device, find_device};
    use crate::{
        apis::{ActionRequest, ActionStatus, DeviceInfo, MiotBackend, PropRequest, PropSetRequest,
               PropStatus},
        errors::{Error, Result},
    };

    /// 记录调用并返回预置回执的离线替身。
    struct StubBackend {
        calls: RefCell<Vec<Value>>,
        prop_code: i64,
        prop_value: Value,
        action_code: i64,
    }

    impl StubBackend {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                prop_code: 0,
                prop_value: json!(true),
                action_code: 0,
            }
        }

        fn with_prop_code(code: i64) -> Self {
            Self {
                prop_code: code,
                ..Self::new()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.borrow().len()
        }
    }

    impl MiotBackend for StubBackend {
        fn get_properties(&self, requests: &[PropRequest]) -> Result<Vec<PropStatus>> {
            self.calls
                .borrow_mut()
                .push(json!({"op": "get", "params": serde_json::to_value(requests).unwrap()}));
            Ok(requests
                .iter()
                .map(|request| PropStatus {
                    did: Some(request.did.clone()),
                    siid: request.siid,
                    piid: request.piid,
                    code: self.prop_code,
                    value: Some(self.prop_value.clone()),
                })
                .collect())
        }

        fn set_properties(&self, requests: &[PropSetRequest]) -> Result<Vec<PropStatus>> {
            self.calls
                .borrow_mut()
                .push(json!({"op": "set", "params": serde_json::to_value(requests).unwrap()}));
            Ok(requests
                .iter()
                .map(|request| PropStatus {
                    did: Some(request.did.clone()),
                    siid: request.siid,
                    piid: request.piid,
                    code: self.prop_code,
                    value: None,
                })
                .collect())
        }

        fn run_action(&self, request: &ActionRequest) -> Result<ActionStatus> {
            self.calls
                .borrow_mut()
                .push(json!({"op": "action", "params": serde_json::to_value(request).unwrap()}));
            Ok(ActionStatus {
                code: self.action_code,
                out: Some(vec![]),
            })
        }
    }

    fn prop(
        name: &str,
        value_type: ValueType,
        access: Access,
        range: Option<ValueRange>,
        enum_values: Vec<Value>,
        piid: u64,
    ) -> PropertyDescriptor {
        PropertyDescriptor {
            name: name.to_string(),
            description: String::new(),
            value_type,
            access,
            unit: None,
            range,
            enum_values,
            siid: 2,
            piid,
        }
    }

    fn test_spec() -> DeviceSpec {
        let mut properties = BTreeMap::new();
        let _ = properties.insert(
            "on".to_string(),
            prop("on", ValueType::Bool, Access::ReadWrite, None, vec![], 1),
        );
        let _ = properties.insert(
            "temperature".to_string(),
            prop(
                "temperature",
                ValueType::Int,
                Access::ReadWrite,
                Some(ValueRange {
                    min: 16.0,
                    max: 30.0,
                    step: None,
                }),
                vec![],
                2,
            ),
        );
        let _ = properties.insert(
            "level".to_string(),
            prop(
                "level",
                ValueType::Int,
                Access::ReadWrite,
                Some(ValueRange {
                    min: 16.0,
                    max: 30.0,
                    step: Some(2.0),
                }),
                vec![],
                3,
            ),
        );
        let _ = properties.insert(
            "mode".to_string(),
            prop(
                "mode",
                ValueType::Uint,
                Access::ReadWrite,
                None,
                vec![json!(0), json!(1), json!(2)],
                4,
            ),
        );
        let _ = properties.insert(
            "firmware".to_string(),
            prop("firmware", ValueType::String, Access::Read, None, vec![], 5),
        );
        let _ = properties.insert(
            "reset-token".to_string(),
            prop("reset-token", ValueType::String, Access::Write, None, vec![], 6),
        );

        let mut actions = BTreeMap::new();
        let _ = actions.insert(
            "toggle".to_string(),
            ActionDescriptor {
                name: "toggle".to_string(),
                description: String::new(),
                siid: 2,
                aiid: 1,
            },
        );

        DeviceSpec {
            name: "测试台灯".to_string(),
            model: "demo.light.test".to_string(),
            properties,
            actions,
        }
    }

    fn test_device(backend: &StubBackend) -> Device<'_> {
        Device::new(
            backend,
            DeviceInfo {
                did: "did-1001".to_string(),
                name: "台灯".to_string(),
                model: "demo.light.test".to_string(),
                is_online: true,
            },
            test_spec(),
            Duration::ZERO,
        )
    }

    #[test]
    fn get_routes_did_siid_piid_and_returns_value() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        let value = device.get("on").unwrap();
        assert_eq!(value, json!(true));
        assert_eq!(backend.call_count(), 1);
        let call = backend.calls.borrow()[0].clone();
        assert_eq!(call["op"], "get");
        assert_eq!(
            call["params"],
            json!([{"did": "did-1001", "siid": 2, "piid": 1}])
        );
    }

    #[test]
    fn set_sends_coerced_value_once() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        device.set("on", &json!(true)).unwrap();
        assert_eq!(backend.call_count(), 1);
        let call = backend.calls.borrow()[0].clone();
        assert_eq!(call["op"], "set");
        assert_eq!(
            call["params"],
            json!([{"did": "did-1001", "siid": 2, "piid": 1, "value": true}])
        );
    }

    #[test]
    fn action_without_args_has_no_value_key() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        device.run_action("toggle", None).unwrap();
        let call = backend.calls.borrow()[0].clone();
        assert_eq!(call["op"], "action");
        assert_eq!(
            call["params"],
            json!({"did": "did-1001", "siid": 2, "aiid": 1})
        );
    }

    #[test]
    fn action_with_args_carries_value_list() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        device.run_action("toggle", Some(vec![json!(2)])).unwrap();
        let call = backend.calls.borrow()[0].clone();
        assert_eq!(call["params"]["value"], json!([2]));
    }

    #[test]
    fn range_boundaries_are_inclusive() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        assert!(device.set("temperature", &json!(15)).is_err());
        assert!(device.set("temperature", &json!(31)).is_err());
        assert!(device.set("temperature", &json!(16)).is_ok());
        assert!(device.set("temperature", &json!(30)).is_ok());
    }

    #[test]
    fn step_misalignment_is_rejected_not_rounded() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        assert!(device.set("level", &json!(17)).is_err());
        assert!(device.set("level", &json!(18)).is_ok());
    }

    #[test]
    fn enum_values_must_match_exactly() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        assert!(device.set("mode", &json!(3)).is_err());
        assert!(device.set("mode", &json!(2)).is_ok());
    }

    #[test]
    fn bool_accepts_literals_and_zero_one() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        assert!(device.set("on", &json!("true")).is_ok());
        assert!(device.set("on", &json!("false")).is_ok());
        assert!(device.set("on", &json!(1)).is_ok());
        assert!(device.set("on", &json!(0)).is_ok());
        assert!(device.set("on", &json!("yes")).is_err());
        assert!(device.set("on", &json!(2)).is_err());
    }

    #[test]
    fn uint_rejects_negative_values() {
        let backend = StubBackend::new();
        let device = test_device(&backend);
        assert!(device.set("mode", &json!(-1)).is_err());
    }

    #[test]
    fn validation_failures_never_reach_backend() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        let _ = device.set("temperature", &json!(15));
        let _ = device.set("level", &json!(17));
        let _ = device.set("mode", &json!(3));
        let _ = device.set("on", &json!("yes"));
        let _ = device.get("reset-token");
        let _ = device.set("firmware", &json!("v2"));
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn unknown_property_error_lists_valid_names() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        let err = device.get("nope").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("不支持的属性 'nope'"));
        assert!(text.contains("on"));
        assert!(text.contains("temperature"));
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn write_only_get_and_read_only_set_are_rejected() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        assert!(matches!(
            device.get("reset-token").unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            device.set("firmware", &json!("v2")).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn nonzero_prop_code_maps_to_device_error_with_code_table() {
        let backend = StubBackend::with_prop_code(-704042011);
        let device = test_device(&backend);

        let err = device.get("on").unwrap_err();
        match &err {
            Error::DeviceGet { device, name, code } => {
                assert_eq!(device, "台灯");
                assert_eq!(name, "on");
                assert_eq!(*code, -704042011);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("设备离线"));
    }

    #[test]
    fn string_property_passes_through_unchanged() {
        let backend = StubBackend::new();
        let device = test_device(&backend);

        device.set("reset-token", &json!("abc")).unwrap();
        let call = backend.calls.borrow()[0].clone();
        assert_eq!(call["params"][0]["value"], json!("abc"));
    }

    #[test]
    fn find_device_matches_did_then_unique_name() {
        let devices = vec![
            DeviceInfo {
                did: "1".to_string(),
                name: "台灯".to_string(),
                model: "a".to_string(),
                is_online: true,
            },
            DeviceInfo {
                did: "2".to_string(),
                name: "插座".to_string(),
                model: "b".to_string(),
                is_online: false,
            },
            DeviceInfo {
                did: "3".to_string(),
                name: "台灯".to_string(),
                model: "a".to_string(),
                is_online: true,
            },
        ];

        assert_eq!(find_device(&devices, "2").unwrap().name, "插座");
        assert_eq!(find_device(&devices, "插座").unwrap().did, "2");
        assert!(matches!(
            find_device(&devices, "台灯").unwrap_err(),
            Error::MultipleDevicesFound(_)
        ));
        assert!(matches!(
            find_device(&devices, "不存在").unwrap_err(),
            Error::DeviceNotFound(_)
        ));
    }
}
