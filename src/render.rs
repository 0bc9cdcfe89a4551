use crate::prediction_client::PredictionCandidate;
use crate::workflow::{Phase, WorkflowSnapshot};

/// Uses listed per alternative before collapsing the rest.
const ALTERNATIVE_USES_SHOWN: usize = 2;

/// Plain-text rendering of the current workflow state.
pub fn render_snapshot(snapshot: &WorkflowSnapshot) -> String {
    let mut lines = Vec::new();

    match snapshot.phase {
        Phase::Idle => {
            lines.push("Upload an image or use your camera to take a photo".to_string());
        }
        Phase::CameraActive => {
            if snapshot.camera_streaming {
                lines.push(
                    "Camera live - `capture` to take a photo, `cancel` to close".to_string(),
                );
            } else {
                lines.push("Waiting for camera...".to_string());
            }
        }
        Phase::ImageReady => {
            if let Some(image) = &snapshot.image {
                lines.push(format!(
                    "Image ready ({}, {} bytes) - `predict` to analyze",
                    image.mime_type(),
                    image.len()
                ));
            }
        }
        Phase::Predicting => lines.push("Analyzing plant image...".to_string()),
        Phase::Success => {
            if let Some(predictions) = &snapshot.predictions {
                render_primary(predictions.primary(), &mut lines);

                if snapshot.has_alternatives() {
                    lines.push(String::new());
                    let verb = if snapshot.show_all { "Hide" } else { "Show" };
                    lines.push(format!("`toggle`: {} Alternative Predictions", verb));
                    for alternative in snapshot.visible_alternatives() {
                        render_alternative(alternative, &mut lines);
                    }
                }
            }
        }
        Phase::Error => {}
    }

    if let Some(error) = &snapshot.error {
        if error.is_network_failure() {
            lines.push(format!("Could not identify the plant: {}", error));
        } else {
            lines.push(format!("{}", error));
        }
    }

    lines.join("\n")
}

fn render_primary(candidate: &PredictionCandidate, lines: &mut Vec<String>) {
    lines.push(format!(
        "{} ({} confidence)",
        candidate.label,
        candidate.confidence_percent()
    ));
    lines.push(candidate.info.description.clone());
    lines.push("Ayurvedic Uses:".to_string());
    for use_ in &candidate.info.uses {
        lines.push(format!("  - {}", use_));
    }
}

fn render_alternative(candidate: &PredictionCandidate, lines: &mut Vec<String>) {
    lines.push(format!(
        "  * {} ({} confidence)",
        candidate.label,
        candidate.confidence_percent()
    ));
    lines.push(format!("    {}", candidate.info.description));
    lines.extend(
        summarize_uses(&candidate.info.uses, ALTERNATIVE_USES_SHOWN)
            .into_iter()
            .map(|line| format!("    - {}", line)),
    );
}

/// First `limit` uses, then a "...and N more" line for the remainder.
pub fn summarize_uses(uses: &[String], limit: usize) -> Vec<String> {
    let mut lines: Vec<String> = uses.iter().take(limit).cloned().collect();
    if uses.len() > limit {
        lines.push(format!("...and {} more", uses.len() - limit));
    }
    lines
}
