use crate::activity::ActivityWindow;
use crate::block::BlockState;
use crate::cache::LocalCache;
use crate::policy::GuardPolicy;
use serde::de::DeserializeOwned;
use serde::Serialize;

const POLICY_KEY: &str = "guard.policy";
const BLOCK_KEY: &str = "guard.block";
const ACTIVITY_KEY: &str = "guard.activity";

fn load<T: DeserializeOwned>(cache: &dyn LocalCache, key: &str) -> anyhow::Result<Option<T>> {
    match cache.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn save<T: Serialize>(cache: &dyn LocalCache, key: &str, value: &T) -> anyhow::Result<()> {
    let data = serde_json::to_vec(value)?;
    cache.set(key, &data)
}

/// Last policy seen by this profile, if any.
pub fn load_policy(cache: &dyn LocalCache) -> anyhow::Result<Option<GuardPolicy>> {
    load(cache, POLICY_KEY)
}

pub fn save_policy(cache: &dyn LocalCache, policy: &GuardPolicy) -> anyhow::Result<()> {
    save(cache, POLICY_KEY, policy)
}

pub fn load_block_state(cache: &dyn LocalCache) -> anyhow::Result<BlockState> {
    Ok(load(cache, BLOCK_KEY)?.unwrap_or_default())
}

pub fn save_block_state(cache: &dyn LocalCache, state: &BlockState) -> anyhow::Result<()> {
    if state.active {
        save(cache, BLOCK_KEY, state)
    } else {
        clear_block_state(cache)
    }
}

pub fn clear_block_state(cache: &dyn LocalCache) -> anyhow::Result<()> {
    cache.remove(BLOCK_KEY)
}

pub fn load_activity(cache: &dyn LocalCache) -> anyhow::Result<ActivityWindow> {
    Ok(load(cache, ACTIVITY_KEY)?.unwrap_or_default())
}

pub fn save_activity(cache: &dyn LocalCache, activity: &ActivityWindow) -> anyhow::Result<()> {
    save(cache, ACTIVITY_KEY, activity)
}
