// src/lua.rs - Lua scripts for atomic operations
use redis::Script;

pub struct LuaScripts {
    pub save_record: Script,
    pub publish: Script,
    pub claim_delivery: Script,
    pub settle_delivery: Script,
    pub promote_delayed: Script,
    pub reclaim_expired: Script,
}

impl LuaScripts {
    pub fn new() -> Self {
        // Script::invoke_async loads on NOSCRIPT, so nothing is preloaded here.
        Self {
            save_record: Script::new(include_str!("./lua/save_record.lua")),
            publish: Script::new(include_str!("./lua/publish.lua")),
            claim_delivery: Script::new(include_str!("./lua/claim_delivery.lua")),
            settle_delivery: Script::new(include_str!("./lua/settle_delivery.lua")),
            promote_delayed: Script::new(include_str!("./lua/promote_delayed.lua")),
            reclaim_expired: Script::new(include_str!("./lua/reclaim_expired.lua")),
        }
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}
