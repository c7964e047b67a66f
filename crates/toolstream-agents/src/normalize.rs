use serde_json::{Map, Value};

/// Unwrap one level of container nesting some models add around tool arguments.
///
/// The first top-level key holding an object is removed and its entries are spliced into the
/// top level, where they override same-named keys. Deeper levels are left alone.
pub fn normalize_arguments(arguments: &Map<String, Value>) -> Map<String, Value> {
    let Some((wrapper, Value::Object(inner))) =
        arguments.iter().find(|(_, value)| value.is_object())
    else {
        return arguments.clone();
    };

    let mut flattened: Map<String, Value> = arguments
        .iter()
        .filter(|(key, _)| *key != wrapper)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for (key, value) in inner {
        flattened.insert(key.clone(), value.clone());
    }
    flattened
}
