//! Session manifest assembly.
//!
//! The manifest is the immutable payload the on-host agent fetches to
//! know what to run. Everything platform-specific is an opaque
//! passthrough from the platform profile and session inputs.

use play_proto::{Host, Mounts, PlatformProfile, SessionManifest};

pub(crate) fn build(host: &Host, profile: &PlatformProfile, client_cert_pem: &str) -> SessionManifest {
    SessionManifest {
        session_id: format!("sess-{}", host.host_id),
        host_id: host.host_id.clone(),
        user_id: host.user_id.clone(),
        platform: host.platform.clone(),
        app_image: profile.app_image.clone(),
        rom_ref: host.rom_ref.clone(),
        save_ref: host.save_ref.clone(),
        save_filename: host.save_ref.as_deref().map(basename),
        firmware_ref: profile.firmware_ref.clone(),
        fake_time: None,
        app_config: profile.default_app_config.clone(),
        resolution: profile.resolution.clone(),
        fps: profile.fps,
        codec: profile.codec,
        client_cert: client_cert_pem.to_string(),
        dual_screen: profile.dual_screen.clone(),
        mounts: Mounts::default(),
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}
