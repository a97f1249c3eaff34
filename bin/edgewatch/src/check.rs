use std::io::{self, Write};

use edgewatch_components::registry::{ElementKind, ElementPlan, PipelineBuilder, PipelinePlan, RegistryError};
use edgewatch_config::{EdgewatchConfiguration, GenericConfiguration};
use edgewatch_error::{generic_error, ErrorContext as _, GenericError};

/// Entrypoint for the `check-config` command.
///
/// Fails if no pipeline could be planned.
pub fn handle_check_config_command(configuration: &GenericConfiguration) -> Result<(), GenericError> {
    let config = configuration
        .as_typed::<EdgewatchConfiguration>()
        .error_context("Failed to load engine configuration.")?;

    let plans = PipelineBuilder::new(&config).plan_all();
    let stdout = io::stdout();
    let planned = write_report(&mut stdout.lock(), &config, &plans).error_context("Failed to write report.")?;

    if planned == 0 {
        return Err(generic_error!("No pipelines could be built from the configuration."));
    }
    Ok(())
}

/// Writes a human readable report of the planned pipelines, returning how many were planned successfully.
fn write_report<W: Write>(
    out: &mut W, config: &EdgewatchConfiguration, plans: &[Result<PipelinePlan, RegistryError>],
) -> io::Result<usize> {
    writeln!(out, "data_dir: {}", config.data_dir.display())?;
    writeln!(
        out,
        "health: warn after {:?}, terminal after {:?}, polled every {:?}",
        config.health.warn_threshold, config.health.terminal_threshold, config.health.poll_interval
    )?;

    let mut planned = 0;
    for (name, plan) in config.pipelines.keys().zip(plans) {
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                writeln!(out, "pipeline {}: not buildable: {}", name, e)?;
                continue;
            }
        };

        planned += 1;
        writeln!(out, "pipeline {}:", plan.name)?;
        writeln!(out, "  - source {} ({})", plan.source_name, plan.source.uri)?;
        for element in &plan.elements {
            let note = match element {
                ElementPlan::DetectObjects(_) | ElementPlan::DetectFaces(_) => " (requires an inference provider)",
                ElementPlan::SaveDetections(_) => "",
            };
            writeln!(out, "  - {}{}", element.kind(), note)?;
        }
        writeln!(out, "  - health_check")?;
        for skipped in &plan.skipped {
            writeln!(
                out,
                "  skipped #{} {}: {}",
                skipped.position, skipped.name, skipped.reason
            )?;
        }
    }

    if plans.iter().flatten().any(|plan| {
        plan.elements
            .iter()
            .any(|element| matches!(element.kind(), ElementKind::DetectObjects | ElementKind::DetectFaces))
    }) {
        writeln!(
            out,
            "note: this build has no inference provider, detection elements will be left out at startup"
        )?;
    }

    Ok(planned)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use edgewatch_config::ConfigurationLoader;

    use super::*;

    #[test]
    fn report_lists_chains_and_problems() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
data_dir: /var/lib/edgewatch
sources:
  front_door:
    uri: rtsp://camera.local/stream
pipelines:
  watch:
    - source: front_door
    - detect_objects: { model: { tflite: /models/ssd.tflite }, labels: /models/coco.txt }
    - flip_image: {}
    - save_detections: {}
  broken:
    - save_detections: {}
"#,
        )
        .unwrap();
        let config = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_typed::<EdgewatchConfiguration>()
            .unwrap();

        let plans = PipelineBuilder::new(&config).plan_all();
        let mut out = Vec::new();
        let planned = write_report(&mut out, &config, &plans).unwrap();
        let report = String::from_utf8(out).unwrap();

        assert_eq!(planned, 1);
        assert!(report.contains("pipeline broken: not buildable"));
        assert!(report.contains("  - source front_door (rtsp://camera.local/stream)\n"));
        assert!(report.contains("  - detect_objects (requires an inference provider)\n  - save_detections\n  - health_check\n"));
        assert!(report.contains("skipped #2 flip_image: Unknown pipeline element 'flip_image'."));
        assert!(report.contains("note: this build has no inference provider"));
    }
}
