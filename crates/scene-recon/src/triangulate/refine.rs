use super::problem::{Estimate, Problem};

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct StepReport {
    pub error_px: f64,
    pub converged: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct RefineSummary {
    pub iterations: usize,
    pub converged: bool,
    pub error_px: f64,
}

/// One refinement pass: re-pose every free image from the current markers,
/// then re-triangulate every marker from the new poses.
pub(crate) fn refine_step(
    problem: &Problem<'_>,
    estimate: &Estimate,
    previous_error_px: f64,
) -> (Estimate, StepReport) {
    let poses = estimate
        .poses
        .iter()
        .map(|(id, pose)| {
            let pose = if problem.is_fixed(id) {
                *pose
            } else {
                problem.repose_image(id, *pose, &estimate.markers)
            };
            (id.clone(), pose)
        })
        .collect();

    let markers = estimate
        .markers
        .iter()
        .map(|(id, corners)| {
            let corners = problem
                .triangulate_marker(*id, &poses, Some(corners))
                .map_or(*corners, |(c, _)| c);
            (*id, corners)
        })
        .collect();

    let next = Estimate { poses, markers };
    let error_px = problem.total_rms_px(&next);
    let params = problem.params;
    let converged = error_px < params.convergence_threshold_px
        || (previous_error_px - error_px).abs() < params.convergence_epsilon_px;
    (
        next,
        StepReport {
            error_px,
            converged,
        },
    )
}

/// Run [`refine_step`] until it reports convergence or the iteration cap is
/// reached. The lowest-error estimate seen is returned either way, and the
/// summary carries its error.
pub(crate) fn refine(problem: &Problem<'_>, initial: Estimate) -> (Estimate, RefineSummary) {
    let mut error_px = problem.total_rms_px(&initial);
    log::debug!("refinement start: rms {error_px:.6} px");
    let mut estimate = initial.clone();
    let mut best = (initial, error_px);

    let mut iterations = 0;
    let mut converged = false;
    while iterations < problem.params.max_iterations && !converged {
        iterations += 1;
        let (next, report) = refine_step(problem, &estimate, error_px);
        log::debug!("refinement {iterations}: rms {:.6} px", report.error_px);
        estimate = next;
        error_px = report.error_px;
        converged = report.converged;
        // a NaN error never replaces the best estimate
        if error_px < best.1 {
            best = (estimate.clone(), error_px);
        }
    }

    let (estimate, error_px) = best;
    (
        estimate,
        RefineSummary {
            iterations,
            converged,
            error_px,
        },
    )
}
