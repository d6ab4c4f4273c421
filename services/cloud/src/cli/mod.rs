//! mjc-cloud CLI 分发：`login`、`devices`、`homes`、`scenes`、`run-scene`、
//! `consumables`、`spec`、`get`、`set`、`action`、`status`、`decrypt`、`version`。

use std::time::Duration;

use anyhow::{Context, anyhow};
use mjc_shared_protocol::cipher;
use qrcode::{QrCode, render::unicode};
use serde_json::Value;

use crate::{
    apis::CloudApi,
    config,
    device::{Device, find_device},
    session::SessionManager,
    spec::{SpecResolver, SpecStore},
    transport::{Transport, WireProtocol},
};

/// 全局开关：认证文件路径与线协议代际。
struct CliOptions {
    auth_path: Option<String>,
    protocol: WireProtocol,
}

/// 解析并执行 CLI；每个子命令执行完即返回。
pub fn dispatch(args: &[String]) -> anyhow::Result<()> {
    let (options, rest) = split_options(args)?;
    let Some(command) = rest.first() else {
        print_root_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_root_help();
        return Ok(());
    }

    match command.as_str() {
        "login" => run_login(&options, &rest[1..]),
        "devices" => run_devices(&options),
        "homes" => run_homes(&options),
        "scenes" => {
            let home_id = rest
                .get(1)
                .ok_or_else(|| anyhow!("usage: mjc-cloud scenes <home_id>"))?;
            run_scenes(&options, home_id)
        }
        "run-scene" => {
            let scene_id = rest
                .get(1)
                .ok_or_else(|| anyhow!("usage: mjc-cloud run-scene <scene_id>"))?;
            run_scene(&options, scene_id)
        }
        "consumables" => {
            let home_id = rest
                .get(1)
                .and_then(|raw| raw.parse::<i64>().ok())
                .ok_or_else(|| anyhow!("usage: mjc-cloud consumables <home_id>"))?;
            run_consumables(&options, home_id)
        }
        "spec" => {
            let model = rest
                .get(1)
                .ok_or_else(|| anyhow!("usage: mjc-cloud spec <model>"))?;
            run_spec(model)
        }
        "get" => {
            let [device_key, prop_name] = positional::<2>(&rest[1..])
                .ok_or_else(|| anyhow!("usage: mjc-cloud get <device> <property>"))?;
            run_get(&options, device_key, prop_name)
        }
        "set" => {
            let [device_key, prop_name, raw_value] = positional::<3>(&rest[1..])
                .ok_or_else(|| anyhow!("usage: mjc-cloud set <device> <property> <value>"))?;
            run_set(&options, device_key, prop_name, raw_value)
        }
        "action" => {
            if rest.len() < 3 {
                return Err(anyhow!(
                    "usage: mjc-cloud action <device> <action> [json-args]"
                ));
            }
            run_action(&options, &rest[1], &rest[2], rest.get(3).map(String::as_str))
        }
        "status" => run_status(&options),
        "decrypt" => run_decrypt(&rest[1..]),
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => Err(anyhow!(
            "unknown command: {other}; run `mjc-cloud --help` for usage"
        )),
    }
}

/// 提取全局开关，返回剩余位置参数。
fn split_options(args: &[String]) -> anyhow::Result<(CliOptions, Vec<String>)> {
    let mut options = CliOptions {
        auth_path: None,
        protocol: WireProtocol::Plain,
    };
    let mut rest = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-p" | "--auth-path" => {
                let Some(raw) = args.get(i + 1) else {
                    return Err(anyhow!("--auth-path requires value"));
                };
                options.auth_path = Some(raw.clone());
                i += 2;
            }
            "--rc4" => {
                options.protocol = WireProtocol::EncryptedRc4;
                i += 1;
            }
            _ => {
                rest.push(args[i].clone());
                i += 1;
            }
        }
    }
    Ok((options, rest))
}

/// 固定个数的位置参数。
fn positional<const N: usize>(args: &[String]) -> Option<[&str; N]> {
    if args.len() != N {
        return None;
    }
    let mut out = [""; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg.as_str();
    }
    Some(out)
}

/// 绑定认证文件创建会话管理器。
fn open_session(options: &CliOptions) -> anyhow::Result<SessionManager> {
    let path = config::resolve_auth_path(options.auth_path.as_deref())
        .context("无法确定认证文件路径（HOME 未设置）")?;
    Ok(SessionManager::with_auth_file(path)?)
}

/// 打开会话并确保可用（含一次机会式刷新）。
fn ready_session(options: &CliOptions) -> anyhow::Result<SessionManager> {
    let mut manager = open_session(options)?;
    manager.ensure_available()?;
    Ok(manager)
}

fn run_login(options: &CliOptions, args: &[String]) -> anyhow::Result<()> {
    let mut manager = open_session(options)?;

    if args.first().map(String::as_str) == Some("--qr") {
        let auth = manager.login_qr(&mut print_qr)?;
        println!("扫码登录成功，userId: {}", auth.user_id);
    } else {
        let [username, password] = positional::<2>(args)
            .ok_or_else(|| anyhow!("usage: mjc-cloud login <username> <password> | login --qr"))?;
        let auth = manager.login(username, password)?;
        println!("登录成功，userId: {}", auth.user_id);
    }
    println!("凭证已保存到 {}", manager.auth_path().display());
    Ok(())
}

/// 终端渲染二维码；渲染失败时退回打印登录地址。
fn print_qr(url: &str) {
    println!("请使用米家 APP 扫描下方二维码登录:");
    match QrCode::new(url.as_bytes()) {
        Ok(code) => {
            let rendered = code
                .render::<unicode::Dense1x2>()
                .quiet_zone(true)
                .build();
            println!("{rendered}");
        }
        Err(err) => println!("二维码生成失败（{err}），请直接打开: {url}"),
    }
}

fn run_devices(options: &CliOptions) -> anyhow::Result<()> {
    let manager = ready_session(options)?;
    let auth = manager.session().context("会话不可用")?;
    let api = CloudApi::new(Transport::new(options.protocol)?, auth);

    let devices = api.get_devices_list()?;
    println!("设备列表:");
    for device in devices {
        println!(
            "  - {}\n    did: {}\n    model: {}\n    online: {}",
            device.name, device.did, device.model, device.is_online
        );
    }
    Ok(())
}

fn run_homes(options: &CliOptions) -> anyhow::Result<()> {
    let manager = ready_session(options)?;
    let auth = manager.session().context("会话不可用")?;
    let api = CloudApi::new(Transport::new(options.protocol)?, auth);

    let homes = api.get_homes_list()?;
    print_json(&homes);
    Ok(())
}

fn run_scenes(options: &CliOptions, home_id: &str) -> anyhow::Result<()> {
    let manager = ready_session(options)?;
    let auth = manager.session().context("会话不可用")?;
    let api = CloudApi::new(Transport::new(options.protocol)?, auth);

    let scenes = api.get_scenes_list(home_id)?;
    print_json(&scenes);
    Ok(())
}

fn run_scene(options: &CliOptions, scene_id: &str) -> anyhow::Result<()> {
    let manager = ready_session(options)?;
    let auth = manager.session().context("会话不可用")?;
    let api = CloudApi::new(Transport::new(options.protocol)?, auth);

    let _ = api.run_scene(scene_id)?;
    println!("场景 {scene_id} 运行成功");
    Ok(())
}

fn run_consumables(options: &CliOptions, home_id: i64) -> anyhow::Result<()> {
    let manager = ready_session(options)?;
    let auth = manager.session().context("会话不可用")?;
    let api = CloudApi::new(Transport::new(options.protocol)?, auth);

    let items = api.get_consumable_items(home_id)?;
    print_json(&items);
    Ok(())
}

fn run_spec(model: &str) -> anyhow::Result<()> {
    let resolver = SpecResolver::new(config::spec_cache_dir().map(SpecStore::new))?;
    let spec = resolver.resolve(model)?;
    print!("{spec}");
    Ok(())
}

fn run_get(options: &CliOptions, device_key: &str, prop_name: &str) -> anyhow::Result<()> {
    let manager = ready_session(options)?;
    let auth = manager.session().context("会话不可用")?;
    let api = CloudApi::new(Transport::new(options.protocol)?, auth);

    let device = open_device(&api, device_key)?;
    let value = device.get(prop_name)?;
    let unit = device
        .spec()
        .properties
        .get(prop_name)
        .and_then(|prop| prop.unit.clone())
        .unwrap_or_default();
    println!("{} 的 {prop_name} 值为 {value} {unit}", device.name());
    Ok(())
}

fn run_set(
    options: &CliOptions,
    device_key: &str,
    prop_name: &str,
    raw_value: &str,
) -> anyhow::Result<()> {
    let manager = ready_session(options)?;
    let auth = manager.session().context("会话不可用")?;
    let api = CloudApi::new(Transport::new(options.protocol)?, auth);

    let device = open_device(&api, device_key)?;
    device.set(prop_name, &parse_cli_value(raw_value))?;
    println!("{} 的 {prop_name} 已设置为 {raw_value}", device.name());
    Ok(())
}

fn run_action(
    options: &CliOptions,
    device_key: &str,
    action_name: &str,
    raw_args: Option<&str>,
) -> anyhow::Result<()> {
    let manager = ready_session(options)?;
    let auth = manager.session().context("会话不可用")?;
    let api = CloudApi::new(Transport::new(options.protocol)?, auth);

    let device = open_device(&api, device_key)?;
    let args = raw_args.map(|raw| match parse_cli_value(raw) {
        Value::Array(items) => items,
        single => vec![single],
    });
    let _ = device.run_action(action_name, args)?;
    println!("{} 的动作 {action_name} 执行成功", device.name());
    Ok(())
}

fn run_status(options: &CliOptions) -> anyhow::Result<()> {
    let manager = open_session(options)?;
    println!("认证文件: {}", manager.auth_path().display());
    let Some(auth) = manager.session() else {
        println!("未登录");
        return Ok(());
    };

    println!("账号: {}", auth.user_id);
    if let Some(expire) = &auth.expire_time {
        println!("过期提示: {expire}");
    }
    println!(
        "本地判定: {}",
        if manager.available() { "有效" } else { "过期或不完整" }
    );
    let transport = Transport::new(options.protocol)?;
    println!(
        "服务端探测: {}",
        if manager.probe(&transport) { "可用" } else { "不可用" }
    );
    Ok(())
}

/// 解密抓包数据：`--ssecurity`、`--nonce`、`--data` 取自请求体原文。
fn run_decrypt(args: &[String]) -> anyhow::Result<()> {
    let ssecurity = flag_value(args, "--ssecurity")
        .ok_or_else(|| anyhow!("usage: mjc-cloud decrypt --ssecurity <s> --nonce <n> --data <d>"))?;
    let nonce = flag_value(args, "--nonce")
        .ok_or_else(|| anyhow!("usage: mjc-cloud decrypt --ssecurity <s> --nonce <n> --data <d>"))?;
    let data = flag_value(args, "--data")
        .ok_or_else(|| anyhow!("usage: mjc-cloud decrypt --ssecurity <s> --nonce <n> --data <d>"))?;

    let decrypted = cipher::decrypt_with_nonce(&ssecurity, &nonce, &data)?;
    match serde_json::from_str::<Value>(&decrypted) {
        Ok(value) => print_json(&value),
        Err(_) => println!("{decrypted}"),
    }
    Ok(())
}

/// 在设备列表中定位设备并解析其规格，组装访问句柄。
fn open_device<'a>(api: &'a CloudApi<'_>, device_key: &str) -> anyhow::Result<Device<'a>> {
    let devices = api.get_devices_list()?;
    let info = find_device(&devices, device_key)?;
    let resolver = SpecResolver::new(config::spec_cache_dir().map(SpecStore::new))?;
    let spec = resolver.resolve(&info.model)?;
    Ok(Device::new(api, info, spec, pacing()))
}

/// 节流间隔：环境变量可覆盖，默认半秒。
fn pacing() -> Duration {
    config::pacing_interval()
}

/// CLI 取值解析：合法 JSON 按 JSON 读，其余按字符串传入由校验层收敛。
fn parse_cli_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// 解析 `--key value` 与 `--key=value` 两种写法。
fn flag_value(args: &[String], key: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == key {
            return args.get(i + 1).cloned();
        }
        if let Some(value) = args[i].strip_prefix(&format!("{key}=")) {
            return Some(value.to_string());
        }
        i += 1;
    }
    None
}

fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
    );
}

/// 打印 root help。
fn print_root_help() {
    println!("mjc-cloud usage:");
    println!("  mjc-cloud login <username> <password> | login --qr");
    println!("  mjc-cloud devices");
    println!("  mjc-cloud homes");
    println!("  mjc-cloud scenes <home_id>");
    println!("  mjc-cloud run-scene <scene_id>");
    println!("  mjc-cloud consumables <home_id>");
    println!("  mjc-cloud spec <model>");
    println!("  mjc-cloud get <device> <property>");
    println!("  mjc-cloud set <device> <property> <value>");
    println!("  mjc-cloud action <device> <action> [json-args]");
    println!("  mjc-cloud status");
    println!("  mjc-cloud decrypt --ssecurity <s> --nonce <n> --data <d>");
    println!("  mjc-cloud version");
    println!("global options: [-p|--auth-path <file>] [--rc4]");
}
