//! The default expression function library.
//!
//! [`register`] is the extension hook: external collaborators install
//! additional functions without touching the engine. [`install_stdlib`]
//! registers the built-in string, numeric and asset helpers.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::assets::{AssetIndex, AssetKind};
use crate::registry::Registry;
use crate::script::format_words;
use crate::value::{NativeFn, Value};

/// Install a native function under a registry path.
pub fn register(registry: &Registry, name: &str, function: NativeFn) {
    registry.set_value(name, Value::Function(function));
}

/// Register the built-in function library.
pub fn install_stdlib(registry: &Registry, assets: Arc<AssetIndex>) {
    register(
        registry,
        "length",
        Arc::new(|args| match args.first() {
            Some(Value::String(s)) => Value::from(s.chars().count() as i64),
            Some(Value::Map(m)) => Value::from(m.len() as i64),
            _ => Value::Null,
        }),
    );

    register(
        registry,
        "getOrDefault",
        Arc::new(|args| {
            let primary = args.first().cloned().unwrap_or(Value::Null);
            let is_empty = match &primary {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                _ => false,
            };
            if is_empty {
                args.get(1).cloned().unwrap_or(Value::Null)
            } else {
                primary
            }
        }),
    );

    register(
        registry,
        "nullOrEmpty",
        Arc::new(|args| {
            let empty = match args.first() {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            };
            Value::Bool(empty)
        }),
    );

    register(
        registry,
        "capitalizeWords",
        Arc::new(|args| match args.first() {
            Some(Value::String(s)) => Value::String(format_words(s, 1)),
            _ => Value::Null,
        }),
    );

    register(
        registry,
        "split",
        Arc::new(|args| {
            let (Some(Value::String(text)), Some(Value::String(sep))) =
                (args.first(), args.get(1))
            else {
                return Value::Null;
            };
            let map = crate::registry::ValueMap::new();
            for (i, part) in text.split(sep.as_str()).enumerate() {
                map.set(&i.to_string(), Value::from(part).into_producer());
            }
            Value::Map(Arc::new(map))
        }),
    );

    register(
        registry,
        "randomString",
        Arc::new(|args| {
            if args.is_empty() {
                return Value::Null;
            }
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as usize;
            args[nanos % args.len()].clone()
        }),
    );

    register(
        registry,
        "clamp",
        Arc::new(|args| {
            let (Some(value), Some(min), Some(max)) = (
                args.first().and_then(Value::as_number),
                args.get(1).and_then(Value::as_number),
                args.get(2).and_then(Value::as_number),
            ) else {
                return Value::Null;
            };
            Value::Number(value.clamp(min, max))
        }),
    );

    register(
        registry,
        "round",
        Arc::new(|args| {
            let Some(value) = args.first().and_then(Value::as_number) else {
                return Value::Null;
            };
            let places = args.get(1).and_then(Value::as_number).unwrap_or(0.0) as i32;
            let scale = 10f64.powi(places);
            Value::Number((value * scale).round() / scale)
        }),
    );

    let index = Arc::clone(&assets);
    register(
        registry,
        "getAssetKey",
        Arc::new(move |args| match args.first() {
            Some(Value::String(key)) => Value::from(index.get_key(key)),
            _ => Value::Null,
        }),
    );

    let index = Arc::clone(&assets);
    register(
        registry,
        "getAssetUrl",
        Arc::new(move |args| match args.first() {
            Some(Value::String(key)) => Value::from(index.get_url(key)),
            _ => Value::Null,
        }),
    );

    let index = Arc::clone(&assets);
    register(
        registry,
        "isValidAsset",
        Arc::new(move |args| match args.first() {
            Some(Value::String(key)) => Value::Bool(index.contains(key)),
            _ => Value::Bool(false),
        }),
    );

    let index = Arc::clone(&assets);
    register(
        registry,
        "isCustomAsset",
        Arc::new(move |args| match args.first() {
            Some(Value::String(key)) => Value::Bool(
                index
                    .get(key)
                    .is_some_and(|asset| asset.kind == AssetKind::Custom),
            ),
            _ => Value::Bool(false),
        }),
    );

    let index = assets;
    register(
        registry,
        "randomAsset",
        Arc::new(move |_| Value::from(index.random_key())),
    );
}
