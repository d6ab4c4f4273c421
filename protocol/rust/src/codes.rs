// 文件职责：
// 1) 维护 MIoT 云端返回码到人类可读描述的固定映射表。
// 2) 未收录的返回码统一归为"未知错误"。

/// 返回码描述；未收录时返回 None。
pub fn describe(code: i64) -> Option<&'static str> {
    let text = match code {
        -10000 => "未知错误",
        -10001 => "服务不可用",
        -10002 => "参数无效",
        -10003 => "资源不足",
        -10004 => "内部错误",
        -10005 => "权限不足",
        -10006 => "执行超时",
        -10007 => "设备离线或者不存在",
        -10020 => "未授权（OAuth2）",
        -10030 => "无效的token（HTTP）",
        -10040 => "无效的消息格式",
        -10050 => "无效的证书",
        -704000000 => "未知错误",
        -704010000 => "未授权（设备可能被删除）",
        -704014006 => "没找到设备描述",
        -704030013 => "Property不可读",
        -704030023 => "Property不可写",
        -704030033 => "Property不可订阅",
        -704040002 => "Service不存在",
        -704040003 => "Property不存在",
        -704040004 => "Event不存在",
        -704040005 => "Action不存在",
        -704040999 => "功能未上线",
        -704042001 => "Device不存在",
        -704042011 => "设备离线",
        -704053036 => "设备操作超时",
        -704053100 => "设备在当前状态下无法执行此操作",
        -704083036 => "设备操作超时",
        -704090001 => "Device不存在",
        -704220008 => "无效的ID",
        -704220025 => "Action参数个数不匹配",
        -704220035 => "Action参数错误",
        -704220043 => "Property值错误",
        -704222034 => "Action返回值错误",
        -705004000 | -705004501 => "未知错误",
        -705201013 => "Property不可读",
        -705201015 => "Action执行错误",
        -705201023 => "Property不可写",
        -705201033 => "Property不可订阅",
        -706012000 => "未知错误",
        -706012013 => "Property不可读",
        -706012015 => "Action执行错误",
        -706012023 => "Property不可写",
        -706012033 => "Property不可订阅",
        -706012043 => "Property值错误",
        -706014006 => "没找到设备描述",
        _ => return None,
    };
    Some(text)
}

/// 返回码描述；未收录时回退"未知错误"。
pub fn describe_or_unknown(code: i64) -> &'static str {
    describe(code).unwrap_or("未知错误")
}
