//! Structured JSON logging: one object per line on stdout.

use serde_json::{json, Map, Value};

use crate::state::now_rfc3339;

pub fn json_log(module: &str, mut fields: Map<String, Value>) {
    fields.insert("ts".to_string(), Value::String(now_rfc3339()));
    fields.insert("module".to_string(), Value::String(module.to_string()));
    println!("{}", Value::Object(fields));
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}
