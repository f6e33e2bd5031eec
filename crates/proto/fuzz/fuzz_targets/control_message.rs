//! Fuzz target for control-message decoding in both directions.

#![no_main]
use libfuzzer_sys::fuzz_target;
use wisp_session::gateway::{ControlMessage, EngineInput, EngineOutput, Envelope};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(envelope) = Envelope::from_json(text) else {
        return;
    };
    if let Ok(Some(input)) = EngineInput::from_parts(&envelope.name, &envelope.argv) {
        let again = input.to_envelope();
        assert_eq!(again.name, envelope.name);
    }
    let _ = EngineOutput::from_parts(&envelope.name, &envelope.argv);
});
