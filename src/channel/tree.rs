//! Navigation of JSON documents by slash-separated paths

use serde_json::{Map, Value};

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Value at `path` below `root`; the empty path is `root` itself
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path).try_fold(root, |node, segment| node.as_object()?.get(segment))
}

/// Store `value` at `path`, creating intermediate objects and replacing
/// any scalar found on the way
pub fn set(root: &mut Value, path: &str, value: Value) {
    let mut node = root;
    for segment in segments(path) {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Some(map) = node.as_object_mut() else {
            return;
        };
        node = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    *node = value;
}
