//! 调用指纹：工具名 + 规范化参数 + 作用域 → SHA-256
//!
//! 参数按对象键递归排序后序列化，保证字段顺序不同的等价请求得到同一个 call_key。

use serde_json::Value;
use sha2::{Digest, Sha256};

/// 参与指纹计算的作用域
#[derive(Debug, Clone, Copy, Default)]
pub struct CallScope<'a> {
    /// 仅会话作用域工具填写；其余工具可跨会话合并
    pub session_id: Option<&'a str>,
    pub continuation_id: Option<&'a str>,
    pub requested_model: Option<&'a str>,
    pub capabilities: &'a [String],
}

/// 计算 call_key
pub fn call_key(tool_name: &str, arguments: &Value, scope: &CallScope<'_>) -> String {
    let mut hasher = Sha256::new();
    let mut feed = |label: &str, part: &str| {
        hasher.update(label.as_bytes());
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    };

    feed("tool", tool_name);
    feed("args", &canonical_json(arguments));
    feed("session", scope.session_id.unwrap_or(""));
    feed("continuation", scope.continuation_id.unwrap_or(""));
    feed("model", scope.requested_model.unwrap_or(""));

    let mut caps: Vec<&str> = scope.capabilities.iter().map(String::as_str).collect();
    caps.sort_unstable();
    caps.dedup();
    feed("caps", &caps.join(","));

    format!("{:x}", hasher.finalize())
}

/// 规范化 JSON：对象键排序，其余按 serde_json 默认格式
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
