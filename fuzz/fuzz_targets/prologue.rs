#![no_main]

use libfuzzer_sys::fuzz_target;
use classweave::patch::x86_64::{plan_redirect, PADDING};

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }
    let (addresses, code) = data.split_at(8);
    let address = u64::from_le_bytes(addresses.try_into().unwrap()) & 0x0000_7FFF_FFFF_F000;
    let destination = address.wrapping_add(0x1000);

    if let Ok(plan) = plan_redirect(code, address, destination) {
        assert!(plan.consumed >= plan.jump.len());
        assert!(plan.consumed <= code.len());

        let patch = plan.patch_bytes();
        assert_eq!(patch.len(), plan.consumed);
        assert!(patch[plan.jump.len()..].iter().all(|&b| b == PADDING));

        let _ = plan.relocate(destination + 16);
    }
});
