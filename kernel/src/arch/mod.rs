use libkestrel::{boot::BootHandoff, config::BootConfig};

#[cfg(target_arch = "x86_64")]
pub mod x86;

pub fn init(handoff: &BootHandoff, config: &BootConfig) {
    #[cfg(target_arch = "x86_64")]
    x86::init(handoff, config);
}
