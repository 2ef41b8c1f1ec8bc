pub mod artifact;
pub mod beat;
pub mod conductor;
pub mod console_display;
pub mod header;
pub mod note;
pub mod osc_server;
pub mod simulator;
pub mod span;
pub mod subindex;
pub mod trail;
pub mod ws_server;
