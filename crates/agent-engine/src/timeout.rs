//! Per-job renderer deadline computation.

use agent_workflow::NodeGraph;
use std::time::Duration;

/// `base + steps * per_step`, multiplied by `img2img_multiplier` if any
/// node in `graph` has `inputs.denoise < 1.0`.
pub fn compute_timeout(
    base_timeout_seconds: f64,
    steps: u32,
    per_step_timeout_seconds: f64,
    img2img_multiplier: f64,
    graph: &NodeGraph,
) -> Duration {
    let mut seconds = base_timeout_seconds + steps as f64 * per_step_timeout_seconds;
    if is_img2img(graph) {
        seconds *= img2img_multiplier;
    }
    Duration::from_secs_f64(seconds.max(0.0))
}

fn is_img2img(graph: &NodeGraph) -> bool {
    graph.values().any(|node| {
        node.get("inputs")
            .and_then(|inputs| inputs.get("denoise"))
            .and_then(serde_json::Value::as_f64)
            .is_some_and(|denoise| denoise < 1.0)
    })
}
