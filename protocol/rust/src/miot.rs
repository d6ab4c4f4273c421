// 文件职责：
// 1) 定义设备能力规格的共享类型：值类型、读写权限、属性/动作描述符。
// 2) 提供厂商 format 字符串到五种规范值类型的折叠规则。
// 3) 类型一经解析不可变，供访问器按名字只读查询。

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 属性值的五种规范类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Bool,
    Int,
    Uint,
    Float,
    String,
}

impl ValueType {
    /// 折叠厂商 format：`uint8`/`uint16`/… → uint，`int8`/… → int，
    /// 其余按声明原样匹配；未知 format 返回 None。
    pub fn from_format(format: &str) -> Option<Self> {
        if format.starts_with("uint") {
            return Some(Self::Uint);
        }
        if format.starts_with("int") {
            return Some(Self::Int);
        }
        match format {
            "bool" => Some(Self::Bool),
            "float" => Some(Self::Float),
            "string" => Some(Self::String),
            _ => None,
        }
    }

    /// 类型名，用于校验报错文案。
    pub fn label(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Float => "float",
            Self::String => "string",
        }
    }
}

/// 属性读写权限。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "w")]
    Write,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl Access {
    /// 由 access 标志位组合出权限；读写均缺失视为无效属性。
    pub fn from_flags(read: bool, write: bool) -> Option<Self> {
        match (read, write) {
            (true, true) => Some(Self::ReadWrite),
            (true, false) => Some(Self::Read),
            (false, true) => Some(Self::Write),
            (false, false) => None,
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// 数值属性的取值范围；step 缺省表示连续取值。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    // 解析后的属性名，设备内唯一。
    pub name: String,
    // 属性描述文本。
    pub description: String,
    // 规范值类型。
    pub value_type: ValueType,
    // 读写权限。
    pub access: Access,
    // 计量单位（目录声明了才有）。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    // 数值范围约束。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ValueRange>,
    // 枚举约束；非空时取值必须逐项精确匹配。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    // 路由：服务 ID。
    pub siid: u64,
    // 路由：属性 ID。
    pub piid: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    // 解析后的动作名，设备内唯一。
    pub name: String,
    // 动作描述文本。
    pub description: String,
    // 路由：服务 ID。
    pub siid: u64,
    // 路由：动作 ID。
    pub aiid: u64,
}

/// 一个 model 的完整能力规格；解析完成后不再变更。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    pub name: String,
    pub model: String,
    pub properties: BTreeMap<String, PropertyDescriptor>,
    pub actions: BTreeMap<String, ActionDescriptor>,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Read => "r",
            Self::Write => "w",
            Self::ReadWrite => "rw",
        };
        f.write_str(text)
    }
}

impl fmt::Display for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}\n  类型: {}, 权限: {}",
            self.name,
            self.description,
            self.value_type.label(),
            self.access
        )?;
        if let Some(unit) = &self.unit {
            write!(f, ", 单位: {unit}")?;
        }
        if let Some(range) = &self.range {
            write!(f, ", 范围: [{}, {}]", range.min, range.max)?;
            if let Some(step) = range.step {
                write!(f, " 步进 {step}")?;
            }
        }
        if !self.enum_values.is_empty() {
            write!(f, ", 枚举: {}", Value::from(self.enum_values.clone()))?;
        }
        Ok(())
    }
}

impl fmt::Display for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.description)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({})", self.name, self.model)?;
        writeln!(f, "属性:")?;
        for descriptor in self.properties.values() {
            writeln!(f, "  {descriptor}")?;
        }
        writeln!(f, "动作:")?;
        for descriptor in self.actions.values() {
            writeln!(f, "  {descriptor}")?;
        }
        Ok(())
    }
}
