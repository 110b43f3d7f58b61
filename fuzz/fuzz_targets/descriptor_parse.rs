#![no_main]

use libfuzzer_sys::fuzz_target;
use nipoppy::descriptor::{Descriptor, Invocation, build_command};
use nipoppy::subst::SubstEnv;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    // Descriptor deserialization and command building must never panic.
    let Ok(descriptor) = serde_json::from_str::<Descriptor>(input) else {
        return;
    };
    let _ = build_command(&descriptor, &Invocation::new(), &SubstEnv::new());
});
