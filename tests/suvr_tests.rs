//! SUVr processing on a synthetic head phantom

mod common;

use amypet::nifti_io::{read_nifti_file, save_nifti_to_file};
use amypet::suvr::{voi_process, SuvrOptions, REPORT_FILE};
use amypet::vois::VoiDefinitions;
use common::{correlation, head_phantom, CEREBELLUM_LABEL, CORTEX_LABEL};

const DIMS: (usize, usize, usize) = (24, 26, 20);

fn definitions() -> VoiDefinitions {
    [
        ("neocx".to_string(), vec![CORTEX_LABEL as i64]),
        ("cblgm".to_string(), vec![CEREBELLUM_LABEL as i64]),
        ("wc".to_string(), vec![CEREBELLUM_LABEL as i64]),
    ]
    .into_iter()
    .collect()
}

fn options(out: &std::path::Path) -> SuvrOptions {
    SuvrOptions {
        vois: Some(definitions()),
        ref_vois: vec!["wc".to_string()],
        outpath: Some(out.to_path_buf()),
        t1_bias_correction: false,
        ..Default::default()
    }
}

/// PET, T1w and labels on disk; the T1w has its own contrast
fn write_inputs(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
    let (pet, labels) = head_phantom(DIMS, 2.0, 2.0, 1.0);
    let (t1w, _) = head_phantom(DIMS, 2.0, 80.0, 120.0);
    let fpet = dir.join("pet.nii.gz");
    let ft1w = dir.join("t1w.nii.gz");
    let flbl = dir.join("labels.nii.gz");
    save_nifti_to_file(&fpet, &pet).unwrap();
    save_nifti_to_file(&ft1w, &t1w).unwrap();
    save_nifti_to_file(&flbl, &labels).unwrap();
    (fpet, ft1w, flbl)
}

#[test]
fn test_voi_process_recovers_suvr() {
    let tmp = tempfile::tempdir().unwrap();
    let (fpet, ft1w, flbl) = write_inputs(tmp.path());
    let out = tmp.path().join("out");

    let res = voi_process(&fpet, &flbl, &ft1w, &options(&out)).unwrap();

    // Static image in <out>/<pet core name>_suvr
    assert!(res.static_image.fstat.starts_with(out.join("pet_suvr")));
    assert!(res.static_image.fstat.is_file());
    assert_eq!(res.trim_scale, 1);
    assert!(res.ftrm.is_file());
    assert!(res.fbc.is_none());

    // Registration of the same anatomy stays close to identity
    let reg = res.registration.as_ref().unwrap();
    assert!(reg.translations.iter().all(|t| t.abs() < 1.5), "{:?}", reg.translations);
    assert!(reg.faff.as_ref().unwrap().is_file());

    let wc = &res.suvr["wc"];
    assert!((wc.values["wc"] - 1.0).abs() < 1e-12);
    assert!((wc.values["neocx"] - 2.0).abs() < 0.1, "neocx SUVr {}", wc.values["neocx"]);
    assert!(wc.fsuvr.is_file());
    assert!(wc.fsuvr.file_name().unwrap().to_string_lossy().starts_with("SUVr_ref-wc_"));

    assert!(res.flbl.is_file());
    assert!(res.fqc.as_ref().unwrap().is_file());
    assert!(res.static_image.fstat.parent().unwrap().join(REPORT_FILE).is_file());
}

#[test]
fn test_labels_follow_the_pet() {
    let tmp = tempfile::tempdir().unwrap();
    let (fpet, ft1w, flbl) = write_inputs(tmp.path());
    let out = tmp.path().join("out");
    let res = voi_process(&fpet, &flbl, &ft1w, &options(&out)).unwrap();

    // Labels in PET space correlate with the trimmed PET image
    let trimmed = read_nifti_file(&res.ftrm).unwrap();
    let lbl = read_nifti_file(&res.flbl).unwrap();
    assert_eq!(trimmed.dims, lbl.dims);
    let cortex: Vec<f64> = lbl.data.iter().map(|&l| if l == CORTEX_LABEL { 1.0 } else { 0.0 }).collect();
    let mask = vec![1u8; cortex.len()];
    let pet_cortex: Vec<f64> = trimmed.data.iter().map(|&v| if v > 1.5 { 1.0 } else { 0.0 }).collect();
    assert!(correlation(&cortex, &pet_cortex, &mask) > 0.9);
}

#[test]
fn test_existing_labels_reused() {
    let tmp = tempfile::tempdir().unwrap();
    let (fpet, ft1w, flbl) = write_inputs(tmp.path());
    let out = tmp.path().join("out");

    let first = voi_process(&fpet, &flbl, &ft1w, &options(&out)).unwrap();
    assert!(first.registration.is_some());

    let again = SuvrOptions { reg_fresh: false, qc: false, ..options(&out) };
    let second = voi_process(&fpet, &flbl, &ft1w, &again).unwrap();
    assert!(second.registration.is_none());
    assert!(second.fqc.is_none());
    assert_eq!(first.flbl, second.flbl);
    assert_eq!(first.vois["neocx"].vox_no, second.vois["neocx"].vox_no);
}

#[test]
fn test_default_definitions_from_labels() {
    let tmp = tempfile::tempdir().unwrap();
    let (fpet, ft1w, flbl) = write_inputs(tmp.path());
    let opts = SuvrOptions {
        outpath: Some(tmp.path().join("out")),
        t1_bias_correction: false,
        qc: false,
        ..Default::default()
    };
    let res = voi_process(&fpet, &flbl, &ft1w, &opts).unwrap();
    // Background, cortex and cerebellum labels
    assert_eq!(res.vois.len(), 3);
    assert!(res.vois.contains_key("3"));
    assert!(res.vois.contains_key("8"));
    assert!(res.suvr.is_empty());
}
