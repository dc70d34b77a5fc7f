//! Clients and adapters for the external collaborators: the downloader
//! binary, ffmpeg/ffprobe, the LLM endpoint, moderation, VAD, ASR, the
//! chunked uploader and the discovery catalog.

use sysinfo::System;

pub mod asr;
pub mod downloader;
pub mod encoder;
pub mod ffmpeg;
pub mod llm;
pub mod moderation;
pub mod monitor;
pub mod qc;
pub mod translator;
pub mod uploader;
pub mod vad;

/// Share of system memory currently in use, in percent.
pub fn memory_usage_percent() -> f64 {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        return 0.0;
    }
    system.used_memory() as f64 / total as f64 * 100.0
}

/// Memory-pressure heuristic shared by the scheduler and the subtitle
/// translator: above 80% both halve their effective parallelism.
pub fn memory_pressure_high() -> bool {
    memory_usage_percent() > 80.0
}
