use stagehand::presets::{generate_preset, known_presets};
use stagehand::provision::ProvisionerRegistry;
use stagehand::spec::PipelineSpec;
use stagehand::validation::validate_pipeline;
use tempfile::tempdir;

#[test]
fn every_preset_generates_a_valid_pipeline() {
    let temp = tempdir().unwrap();
    let registry = ProvisionerRegistry::with_defaults();

    for preset in known_presets() {
        let destination = temp.path().join(format!("{preset}.yaml"));
        let generated = generate_preset(preset, &destination).unwrap();
        assert!(generated.is_file());

        let spec = PipelineSpec::load(&generated).unwrap();
        let report = validate_pipeline(&spec, &registry);
        assert!(
            report.is_ok(),
            "preset '{preset}' failed validation: {:?}",
            report.errors
        );
    }
}

#[test]
fn desktop_release_preset_carries_the_optional_packaging_stage() {
    let temp = tempdir().unwrap();
    let destination = temp.path().join("desktop.yaml");
    generate_preset("desktop-release", &destination).unwrap();

    let spec = PipelineSpec::load(&destination).unwrap();
    assert_eq!(spec.pipeline, "desktop-release");
    let package = spec.stage("package").expect("package stage");
    assert!(!package.required);
    assert_eq!(package.needs, vec!["build"]);
    assert!(spec.artifact.is_some());
}

#[test]
fn unknown_preset_is_rejected() {
    let temp = tempdir().unwrap();
    let destination = temp.path().join("nope.yaml");
    let err = generate_preset("mainframe", &destination).unwrap_err();
    assert!(err.to_string().contains("Unknown preset 'mainframe'"));
    assert!(!destination.exists());
}
