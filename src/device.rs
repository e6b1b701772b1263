use serde::{Deserialize, Serialize};

///
/// An explicit compute target for one shard of a batch.
///
/// The gradient pipeline never infers placement: the orchestrator assigns
/// shard `i` to `devices[i]` and threads the device through the forward and
/// backward calls, so a caller with accelerators simply lists them here. Each
/// device only ever reads the shared layer weights and writes to its own
/// shard-local intermediates.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    label: String,
}

impl Device {
    pub fn new<S: Into<String>>(label: S) -> Self {
        Device { label: label.into() }
    }

    pub fn cpu(index: usize) -> Self {
        Device { label: format!("cpu:{}", index) }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[test]
fn test_device_labels() {
    assert_eq!("cpu:1", Device::cpu(1).label());
    assert_eq!(Device::new("cpu:0"), Device::cpu(0));
}
