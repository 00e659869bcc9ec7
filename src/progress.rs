//! Progress projection for polling and streamed status.
//!
//! Derives a single 0–100 value and stage label from the persisted
//! document state. The projection is advisory and UI-facing only; the
//! pipeline never consults it. Because the inputs only move forward, the
//! projected value is monotonically non-decreasing over a document's
//! lifetime.

use serde::Serialize;

use crate::models::DocumentStatus;

/// Weighting across the five sub-stages:
/// pending 0 → extracting 0–20 → OCR 20–60 (proportional to completed
/// images) → embedding 60–90 → finalizing/completed 90–100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub percent: u8,
    pub stage: &'static str,
}

pub fn project(
    status: DocumentStatus,
    embedding_status: DocumentStatus,
    image_count: i64,
    ocr_completed: i64,
) -> Progress {
    match status {
        DocumentStatus::Pending => Progress {
            percent: 0,
            stage: "pending",
        },
        DocumentStatus::Completed => Progress {
            percent: 100,
            stage: "completed",
        },
        DocumentStatus::Failed => Progress {
            percent: in_flight_percent(embedding_status, image_count, ocr_completed),
            stage: "failed",
        },
        DocumentStatus::Processing => {
            let percent = in_flight_percent(embedding_status, image_count, ocr_completed);
            let stage = match embedding_status {
                DocumentStatus::Pending if image_count == 0 => "extracting",
                DocumentStatus::Pending => "ocr",
                DocumentStatus::Processing => "embedding",
                DocumentStatus::Completed | DocumentStatus::Failed => "finalizing",
            };
            Progress { percent, stage }
        }
    }
}

fn in_flight_percent(
    embedding_status: DocumentStatus,
    image_count: i64,
    ocr_completed: i64,
) -> u8 {
    match embedding_status {
        DocumentStatus::Pending => {
            if image_count == 0 {
                // Text/image extraction still running; images not known yet.
                5
            } else {
                let done = ocr_completed.clamp(0, image_count);
                (20 + (40 * done) / image_count) as u8
            }
        }
        DocumentStatus::Processing => 70,
        DocumentStatus::Completed | DocumentStatus::Failed => 90,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DocumentStatus::*;

    #[test]
    fn terminal_states() {
        assert_eq!(
            project(Completed, Completed, 4, 4),
            Progress {
                percent: 100,
                stage: "completed"
            }
        );
        assert_eq!(project(Pending, Pending, 0, 0).percent, 0);
    }

    #[test]
    fn ocr_progress_is_proportional() {
        let none = project(Processing, Pending, 10, 0);
        let half = project(Processing, Pending, 10, 5);
        let all = project(Processing, Pending, 10, 10);
        assert_eq!(none.percent, 20);
        assert_eq!(half.percent, 40);
        assert_eq!(all.percent, 60);
        assert_eq!(half.stage, "ocr");
    }

    #[test]
    fn projection_is_monotone_over_a_document_lifetime() {
        // Observations in pipeline order.
        let timeline = [
            project(Pending, Pending, 0, 0),
            project(Processing, Pending, 0, 0),
            project(Processing, Pending, 4, 0),
            project(Processing, Pending, 4, 2),
            project(Processing, Pending, 4, 4),
            project(Processing, Processing, 4, 4),
            project(Processing, Completed, 4, 4),
            project(Completed, Completed, 4, 4),
        ];
        for pair in timeline.windows(2) {
            assert!(
                pair[1].percent >= pair[0].percent,
                "regressed from {:?} to {:?}",
                pair[0],
                pair[1]
            );
        }
        assert!(timeline.iter().all(|p| p.percent <= 100));
    }

    #[test]
    fn failed_reports_the_stage_it_died_in() {
        let failed_early = project(Failed, Pending, 0, 0);
        assert_eq!(failed_early.stage, "failed");
        assert_eq!(failed_early.percent, 5);

        let failed_embedding = project(Failed, Failed, 4, 4);
        assert_eq!(failed_embedding.percent, 90);
    }

    #[test]
    fn documents_without_images_jump_past_ocr() {
        // image_count stays 0 once extraction finished and found nothing;
        // embedding takes over immediately.
        assert_eq!(project(Processing, Processing, 0, 0).percent, 70);
    }
}
