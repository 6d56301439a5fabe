use super::problem::{Estimate, Problem};

/// Grow poses and markers outward from the seeds and supplied poses.
///
/// Each round first poses every image that sees enough located markers,
/// then triangulates every marker seen from at least two posed images.
/// When no image sees four seeds, a pair of three-seed images starts the
/// growth instead.
/// Markers whose triangulation fails the parallax or conditioning limits
/// are left out and retried once more views are posed.
pub(crate) fn bootstrap(problem: &Problem<'_>) -> Estimate {
    let params = problem.params;
    let mut estimate = Estimate {
        poses: problem.known_poses.clone(),
        ..Estimate::default()
    };

    for round in 0..params.max_bootstrap_rounds {
        let mut posed = 0;
        let images: Vec<_> = problem
            .images()
            .filter(|id| !estimate.poses.contains_key(*id))
            .cloned()
            .collect();
        for image_id in images {
            if let Some(pose) = problem.pose_image(&image_id, &estimate.markers) {
                estimate.poses.insert(image_id, pose);
                posed += 1;
            }
        }
        if estimate.poses.is_empty() {
            for (image_id, pose) in problem.pose_seed_pair().into_iter().flatten() {
                estimate.poses.insert(image_id, pose);
                posed += 1;
            }
        }

        let mut located = 0;
        let candidates: Vec<_> = problem
            .by_marker
            .keys()
            .filter(|id| !estimate.markers.contains_key(*id))
            .copied()
            .collect();
        for marker_id in candidates {
            let Some((corners, quality)) =
                problem.triangulate_marker(marker_id, &estimate.poses, None)
            else {
                continue;
            };
            if quality.parallax_deg < params.min_parallax_deg
                || quality.condition > params.max_condition
            {
                continue;
            }
            estimate.markers.insert(marker_id, corners);
            located += 1;
        }

        log::debug!(
            "bootstrap round {round}: +{posed} poses, +{located} markers \
             ({} poses, {} markers)",
            estimate.poses.len(),
            estimate.markers.len()
        );
        if posed == 0 && located == 0 {
            break;
        }
    }
    estimate
}
