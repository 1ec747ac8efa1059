//! Conversion between host frame inputs and Lua tables.

use glowproto::{AudioState, EntityData, PatternConfig, MAX_ENTITY_COUNT};
use mlua::{Lua, Table, Value as LuaValue};

use crate::error::ScriptError;

pub fn audio_table(lua: &Lua, audio: &AudioState) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set(
        "bands",
        lua.create_sequence_from(audio.bands.iter().map(|b| f64::from(*b)))?,
    )?;
    table.set("amplitude", f64::from(audio.amplitude))?;
    table.set("is_beat", audio.is_beat)?;
    table.set("beat_intensity", f64::from(audio.beat_intensity))?;
    table.set("frame", audio.frame as i64)?;
    Ok(table)
}

pub fn config_table(lua: &Lua, config: &PatternConfig) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("entity_count", i64::from(config.entity_count))?;
    table.set("zone_size", i64::from(config.zone_size))?;
    table.set("beat_boost", f64::from(config.beat_boost))?;
    table.set("base_scale", f64::from(config.base_scale))?;
    table.set("max_scale", f64::from(config.max_scale))?;
    Ok(table)
}

/// Read the array returned by `calculate` into clamped entity records.
///
/// `nil` means no entities. Non-table array elements are skipped. Missing
/// fields get defaults: position 0.5, scale `base_scale`, band 0, visible,
/// id `<pattern>_<index>` with a 0-based index.
pub fn read_entities(
    value: LuaValue,
    config: &PatternConfig,
    pattern: &str,
) -> Result<Vec<EntityData>, ScriptError> {
    let table = match value {
        LuaValue::Nil => return Ok(Vec::new()),
        LuaValue::Table(table) => table,
        other => return Err(ScriptError::BadReturn(other.type_name().to_string())),
    };

    let len = table.raw_len().min(MAX_ENTITY_COUNT as usize);
    let mut entities = Vec::with_capacity(len);
    for index in 1..=len {
        if let LuaValue::Table(item) = table.raw_get::<LuaValue>(index)? {
            entities.push(read_entity(&item, index - 1, config, pattern)?);
        }
    }
    Ok(entities)
}

fn read_entity(
    item: &Table,
    index: usize,
    config: &PatternConfig,
    pattern: &str,
) -> Result<EntityData, ScriptError> {
    let id = match item.raw_get::<LuaValue>("id")? {
        LuaValue::String(s) => s.to_string_lossy(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        _ => format!("{pattern}_{index}"),
    };

    let position = |key: &str| -> Result<f32, ScriptError> {
        Ok(number(item, key)?.map(|v| v as f32).unwrap_or(0.5))
    };

    let band = number(item, "band")?
        .filter(|b| b.is_finite())
        .map(|b| b.floor().clamp(0.0, u8::MAX as f64) as u8)
        .unwrap_or(0);

    // Lua truthiness: only nil and false hide an entity
    let visible = !matches!(
        item.raw_get::<LuaValue>("visible")?,
        LuaValue::Boolean(false)
    );

    let entity = EntityData {
        id,
        x: position("x")?,
        y: position("y")?,
        z: position("z")?,
        scale: number(item, "scale")?
            .map(|v| v as f32)
            .unwrap_or(config.base_scale),
        band,
        rotation: number(item, "rotation")?.map(|v| v as f32),
        visible,
    };
    Ok(entity.clamp_to(config))
}

fn number(table: &Table, key: &str) -> Result<Option<f64>, ScriptError> {
    Ok(match table.raw_get::<LuaValue>(key)? {
        LuaValue::Integer(i) => Some(i as f64),
        LuaValue::Number(n) => Some(n),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn eval(lua: &Lua, code: &str) -> LuaValue {
        lua.load(code).eval().unwrap()
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let lua = Lua::new();
        let config = PatternConfig::default();
        let value = eval(&lua, "return { {}, { id = 'named', x = 0.25, visible = false } }");
        let entities = read_entities(value, &config, "demo").unwrap();

        assert_eq!(entities.len(), 2);
        let first = &entities[0];
        assert_eq!(first.id, "demo_0");
        assert_eq!((first.x, first.y, first.z), (0.5, 0.5, 0.5));
        assert_eq!(first.scale, config.base_scale);
        assert_eq!(first.band, 0);
        assert!(first.visible);
        assert_eq!(first.rotation, None);

        let second = &entities[1];
        assert_eq!(second.id, "named");
        assert_eq!(second.x, 0.25);
        assert!(!second.visible);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let lua = Lua::new();
        let config = PatternConfig::default();
        let value = eval(
            &lua,
            "return { { x = -1, y = 7, z = 0/0, scale = 99, band = 12, rotation = 450 } }",
        );
        let e = &read_entities(value, &config, "demo").unwrap()[0];
        assert_eq!((e.x, e.y, e.z), (0.0, 1.0, 0.5));
        assert_eq!(e.scale, config.max_scale);
        assert_eq!(e.band, 4);
        assert_eq!(e.rotation, Some(90.0));
    }

    #[test]
    fn non_table_entries_are_skipped() {
        let lua = Lua::new();
        let value = eval(&lua, "return { 1, 'two', { id = 'kept' } }");
        let entities = read_entities(value, &PatternConfig::default(), "demo").unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id, "kept");
    }

    #[test]
    fn nil_is_empty_and_scalars_are_rejected() {
        let config = PatternConfig::default();
        assert!(read_entities(LuaValue::Nil, &config, "demo").unwrap().is_empty());
        assert!(matches!(
            read_entities(LuaValue::Integer(3), &config, "demo"),
            Err(ScriptError::BadReturn(_))
        ));
    }

    #[test]
    fn audio_bands_are_one_indexed() {
        let lua = Lua::new();
        let audio = AudioState {
            bands: [0.1, 0.2, 0.3, 0.4, 0.5],
            frame: 9,
            ..AudioState::default()
        };
        lua.globals()
            .set("audio", audio_table(&lua, &audio).unwrap())
            .unwrap();
        let (first, count, frame): (f64, i64, i64) = lua
            .load("return audio.bands[1], #audio.bands, audio.frame")
            .eval()
            .unwrap();
        assert!((first - 0.1).abs() < 1e-6);
        assert_eq!(count, 5);
        assert_eq!(frame, 9);
    }
}
