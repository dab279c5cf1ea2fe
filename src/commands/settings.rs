use super::Context;
use crate::config::{validate_setting, SETTING_KEYS};
use crate::storage::{Storage, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SESSION_ID_KEY};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

/// Client state worth showing next to the settings.
const STATE_KEYS: &[&str] = &[SESSION_ID_KEY, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY];

/// Mask long secrets for display: `abcd...wxyz`.
pub fn mask(key: &str, value: &str) -> String {
    if key.ends_with("_token") && value.chars().count() > 8 {
        let chars: Vec<char> = value.chars().collect();
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        value.to_string()
    }
}

pub fn collect(storage: &dyn Storage) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for key in SETTING_KEYS.iter().chain(STATE_KEYS) {
        if let Some(value) = storage.get(key)? {
            map.insert(key.to_string(), mask(key, &value));
        }
    }
    Ok(map)
}

pub fn get(ctx: &Context, key: Option<&str>) -> Result<()> {
    let settings = collect(ctx.db.as_ref())?;
    match key {
        Some(key) => {
            let value = settings
                .get(key)
                .ok_or_else(|| anyhow!("{} is not set", key))?;
            println!("{}", value);
        }
        None => {
            println!("api_base_url (effective) = {}", ctx.config.api_base);
            for (key, value) in settings {
                println!("{} = {}", key, value);
            }
        }
    }
    Ok(())
}

pub fn set(ctx: &Context, key: &str, value: &str) -> Result<()> {
    validate_setting(key, value).map_err(|e| anyhow!(e))?;
    ctx.db.set(key, value.trim())?;
    Ok(())
}

pub fn unset(ctx: &Context, key: &str) -> Result<()> {
    if !SETTING_KEYS.contains(&key) {
        return Err(anyhow!("Unknown setting key: {}", key));
    }
    ctx.db.remove(key)?;
    Ok(())
}
