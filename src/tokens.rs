//! Frame-context token substitution.
//!
//! Argument strings may carry `#TOKEN#` placeholders that are resolved just
//! before a frame is spawned, never at outline construction time.

use crate::frameset::FrameSet;

pub const IFRAME: &str = "#IFRAME#";
pub const ZFRAME: &str = "#ZFRAME#";
pub const FRAME: &str = "#FRAME#";
pub const FRAME_START: &str = "#FRAME_START#";
pub const FRAME_END: &str = "#FRAME_END#";
pub const FRAME_CHUNK: &str = "#FRAME_CHUNK#";
pub const FRAMESPEC: &str = "#FRAMESPEC#";
pub const LAYER: &str = "#LAYER#";
pub const JOB: &str = "#JOB#";

/// Everything a token can resolve to for one frame invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameContext {
    pub job: String,
    pub layer: String,
    pub frame: i64,
    pub frame_start: i64,
    pub frame_end: i64,
    pub chunk_size: usize,
    pub frame_spec: String,
}

impl FrameContext {
    /// Context for `frame` executing the chunk window `local`.
    pub fn new(job: &str, layer: &str, frame: i64, local: &FrameSet, chunk_size: usize) -> Self {
        Self {
            job: job.to_string(),
            layer: layer.to_string(),
            frame,
            frame_start: local.first().unwrap_or(frame),
            frame_end: local.last().unwrap_or(frame),
            chunk_size,
            frame_spec: if local.is_empty() {
                frame.to_string()
            } else {
                local.to_string()
            },
        }
    }

    pub fn zframe(&self) -> String {
        format!("{:04}", self.frame)
    }

    /// Orchestrator-visible frame name, e.g. `0012-render`.
    pub fn frame_name(&self) -> String {
        format!("{}-{}", self.zframe(), self.layer)
    }

    pub fn substitute(&self, input: &str) -> String {
        if !input.contains('#') {
            return input.to_string();
        }
        input
            .replace(FRAME_START, &self.frame_start.to_string())
            .replace(FRAME_END, &self.frame_end.to_string())
            .replace(FRAME_CHUNK, &self.chunk_size.to_string())
            .replace(FRAMESPEC, &self.frame_spec)
            .replace(IFRAME, &self.frame.to_string())
            .replace(ZFRAME, &self.zframe())
            .replace(FRAME, &self.frame_name())
            .replace(LAYER, &self.layer)
            .replace(JOB, &self.job)
    }

    pub fn substitute_all(&self, args: &[String]) -> Vec<String> {
        args.iter().map(|a| self.substitute(a)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FrameContext {
        let local = FrameSet::parse("6-10").unwrap();
        FrameContext::new("show-shot-u_job", "render", 6, &local, 5)
    }

    #[test]
    fn substitutes_frame_tokens() {
        let c = ctx();
        assert_eq!(c.substitute("#IFRAME#"), "6");
        assert_eq!(c.substitute("-s #FRAME_START# -e #FRAME_END#"), "-s 6 -e 10");
        assert_eq!(c.substitute("img.#ZFRAME#.exr"), "img.0006.exr");
        assert_eq!(c.substitute("#FRAME#"), "0006-render");
        assert_eq!(c.substitute("#JOB#/#LAYER#"), "show-shot-u_job/render");
        assert_eq!(c.substitute("#FRAMESPEC# by #FRAME_CHUNK#"), "6-10 by 5");
    }

    #[test]
    fn plain_strings_pass_through() {
        assert_eq!(ctx().substitute("no tokens"), "no tokens");
    }
}
