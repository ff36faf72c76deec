#![no_main]

use authd_pam::relay::Envelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = Envelope::unmarshal(data) {
        let bytes = envelope.marshal().expect("decoded envelopes encode");
        assert_eq!(Envelope::unmarshal(&bytes).ok(), Some(envelope));
    }
});
