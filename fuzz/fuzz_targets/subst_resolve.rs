#![no_main]

use libfuzzer_sys::fuzz_target;
use nipoppy::subst::{SubstEnv, resolve_str, unresolved_tokens};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    let mut env = SubstEnv::new();
    env.insert("PARTICIPANT_ID", "P01");
    env.insert("SESSION_ID", "BL");
    env.insert("DPATH_BIDS", "/data/bids");

    let once = resolve_str(input, &env);
    // Single-pass resolution must be idempotent when nothing new resolves.
    if unresolved_tokens(&once, &env).is_empty() {
        let twice = resolve_str(&once, &env);
        assert_eq!(once, twice);
    }
});
