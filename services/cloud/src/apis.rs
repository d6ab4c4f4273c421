//! 接口封装模块职责：
//! 1. 把设备列表/家庭/场景/耗材等固定端点包装成类型化调用。
//! 2. 定义属性读写与动作执行的请求/回执结构（did/siid/piid/aiid 路由）。
//! 3. 以 `MiotBackend` 作为访问器与传输层之间的接缝，便于离线替身。

use mjc_shared_protocol::AuthPayload;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    errors::{Error, Result},
    transport::Transport,
};

/// 属性读取请求路由。
#[derive(Debug, Clone, Serialize)]
pub struct PropRequest {
    pub did: String,
    pub siid: u64,
    pub piid: u64,
}

/// 属性写入请求路由与取值。
#[derive(Debug, Clone, Serialize)]
pub struct PropSetRequest {
    pub did: String,
    pub siid: u64,
    pub piid: u64,
    pub value: Value,
}

/// 动作执行请求；`value` 缺省时整个键不上送。
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest {
    pub did: String,
    pub siid: u64,
    pub aiid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<Value>>,
}

/// 属性读写的逐项回执。
#[derive(Debug, Clone, Deserialize)]
pub struct PropStatus {
    #[serde(default)]
    pub did: Option<String>,
    #[serde(default)]
    pub siid: u64,
    #[serde(default)]
    pub piid: u64,
    pub code: i64,
    #[serde(default)]
    pub value: Option<Value>,
}

/// 动作执行回执。
#[derive(Debug, Clone, Deserialize)]
pub struct ActionStatus {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub out: Option<Vec<Value>>,
}

/// 设备列表条目。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub did: String,
    pub name: String,
    pub model: String,
    #[serde(rename = "isOnline", default)]
    pub is_online: bool,
}

/// 属性/动作访问器依赖的最小云端能力。
pub trait MiotBackend {
    fn get_properties(&self, requests: &[PropRequest]) -> Result<Vec<PropStatus>>;
    fn set_properties(&self, requests: &[PropSetRequest]) -> Result<Vec<PropStatus>>;
    fn run_action(&self, request: &ActionRequest) -> Result<ActionStatus>;
}

/// 云端接口封装；只读借用会话凭证，凭证的修改与落盘归会话管理器。
pub struct CloudApi<'a> {
    transport: Transport,
    auth: &'a AuthPayload,
}

impl<'a> CloudApi<'a> {
    pub fn new(transport: Transport, auth: &'a AuthPayload) -> Self {
        Self { transport, auth }
    }

    pub fn auth(&self) -> &AuthPayload {
        self.auth
    }

    /// 获取账号下全部设备。
    pub fn get_devices_list(&self) -> Result<Vec<DeviceInfo>> {
        let result = self.transport.call(
            self.auth,
            "/home/device_list",
            &json!({"getVirtualModel": false, "getHuamiDevices": 0}),
        )?;
        let list = result
            .get("list")
            .cloned()
            .ok_or_else(|| Error::Api {
                code: -1,
                message: "设备列表响应缺少 list 字段".to_string(),
            })?;
        Ok(serde_json::from_value(list)?)
    }

    /// 获取家庭列表（含房间信息）。
    pub fn get_homes_list(&self) -> Result<Value> {
        let result = self.transport.call(
            self.auth,
            "/v2/homeroom/gethome",
            &json!({
                "fg": false,
                "fetch_share": true,
                "fetch_share_dev": true,
                "limit": 300,
                "app_ver": 7,
            }),
        )?;
        Ok(result.get("homelist").cloned().unwrap_or(Value::Null))
    }

    /// 获取某家庭下的手动场景列表。
    pub fn get_scenes_list(&self, home_id: &str) -> Result<Value> {
        let result = self.transport.call(
            self.auth,
            "/appgateway/miot/appsceneservice/AppSceneService/GetSceneList",
            &json!({"home_id": home_id}),
        )?;
        Ok(result.get("scene_info_list").cloned().unwrap_or(Value::Null))
    }

    /// 运行场景。
    pub fn run_scene(&self, scene_id: &str) -> Result<Value> {
        self.transport.call(
            self.auth,
            "/appgateway/miot/appsceneservice/AppSceneService/RunScene",
            &json!({"scene_id": scene_id, "trigger_key": "user.click"}),
        )
    }

    /// 获取某家庭下的耗材列表。
    pub fn get_consumable_items(&self, home_id: i64) -> Result<Value> {
        self.transport.call(
            self.auth,
            "/v2/home/standard_consumable_items",
            &json!({"home_id": home_id, "owner_id": self.auth.user_id}),
        )
    }
}

impl MiotBackend for CloudApi<'_> {
    fn get_properties(&self, requests: &[PropRequest]) -> Result<Vec<PropStatus>> {
        let result = self.transport.call(
            self.auth,
            "/miotspec/prop/get",
            &json!({"params": requests}),
        )?;
        Ok(serde_json::from_value(result)?)
    }

    fn set_properties(&self, requests: &[PropSetRequest]) -> Result<Vec<PropStatus>> {
        let result = self.transport.call(
            self.auth,
            "/miotspec/prop/set",
            &json!({"params": requests}),
        )?;
        Ok(serde_json::from_value(result)?)
    }

    fn run_action(&self, request: &ActionRequest) -> Result<ActionStatus> {
        let result =
            self.transport
                .call(self.auth, "/miotspec/action", &json!({"params": request}))?;
        Ok(serde_json::from_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ActionRequest, PropSetRequest};

    #[test]
    fn action_without_args_omits_value_key() {
        let request = ActionRequest {
            did: "1234".to_string(),
            siid: 2,
            aiid: 1,
            value: None,
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded, json!({"did": "1234", "siid": 2, "aiid": 1}));
    }

    #[test]
    fn action_with_args_serializes_value_list() {
        let request = ActionRequest {
            did: "1234".to_string(),
            siid: 2,
            aiid: 1,
            value: Some(vec![json!(2)]),
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["value"], json!([2]));
    }

    #[test]
    fn set_request_keeps_routing_and_value() {
        let request = PropSetRequest {
            did: "1234".to_string(),
            siid: 2,
            piid: 3,
            value: json!(true),
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(
            encoded,
            json!({"did": "1234", "siid": 2, "piid": 3, "value": true})
        );
    }
}
