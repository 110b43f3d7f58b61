#![no_main]

use libfuzzer_sys::fuzz_target;
use nipoppy::tables::TsvTable;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    // Parsing must never panic, and whatever parses must re-render and
    // re-parse to the same table.
    if let Ok(table) = TsvTable::parse(input) {
        if let Ok(rendered) = table.render() {
            let reparsed = TsvTable::parse(&rendered).expect("rendered table parses");
            assert_eq!(table, reparsed);
        }
    }
});
