// amypet/src/main.rs

mod cli;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use clap::Parser;
use comfy_table::{presets::UTF8_FULL, Table};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use amypet::align::{align_suvr, AlignOptions};
use amypet::centiloid::{centiloid, Calibration};
use amypet::classify::{explore_input, ExploreOptions, ExploreResult};
use amypet::config::{load_config, AmyPetConfig};
use amypet::convert::Dcm2niix;
use amypet::error::AmyPetError;
use amypet::nifti_io::read_nifti_file;
use amypet::pipeline::{run_pipeline, suvr_options};
use amypet::static_image::{preproc_suvr, StaticOptions};
use amypet::suvr::voi_process;
use amypet::vois::{default_definitions, extract_vois, VoiOptions, VoiValue};

use cli::{Cli, Commands, SeriesArgs};

const EXPLORE_FILE: &str = "amypet_explore.json";

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn apply_series_args(config: &mut AmyPetConfig, args: &SeriesArgs) {
    if let Some(t) = args.tracer {
        config.tracer = Some(t);
    }
    if let Some(o) = &args.output {
        config.output = Some(o.clone());
    }
}

fn explore_options(config: &AmyPetConfig) -> ExploreOptions {
    ExploreOptions {
        tracer: config.tracer,
        suvr_window: config.suvr_window,
        outpath: config.output.clone(),
        dcm2niix: Dcm2niix::new(config.dcm2niix.clone()),
    }
}

fn progress_printer() -> impl FnMut(usize, usize) + Send {
    |done, total| {
        eprint!("\r   registrations: {}/{}", done, total);
        if done == total {
            eprintln!();
        }
        let _ = std::io::stderr().flush();
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).into_diagnostic()?;
    std::fs::write(path, text).into_diagnostic()?;
    Ok(())
}

fn series_table(res: &ExploreResult) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["#", "Series", "Frames", "Acquisition", "Tracers", "Selected", "Time (s)"]);
    for (i, (s, c)) in res.series.iter().zip(&res.descr).enumerate() {
        let tracers: Vec<String> = c.tracers.iter().map(|t| t.to_string()).collect();
        table.add_row(vec![
            i.to_string(),
            s.description.clone(),
            s.len().to_string(),
            c.labels().join("+"),
            tracers.join(", "),
            format!("{:?}", c.frames),
            format!("{:.0} - {:.0}", c.time.0, c.time.1),
        ]);
    }
    table
}

fn voi_table(vois: &BTreeMap<String, VoiValue>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["VOI", "Voxels", "Mean"]);
    for (name, v) in vois {
        table.add_row(vec![name.clone(), v.vox_no.to_string(), format!("{:.4}", v.mean())]);
    }
    table
}

fn suvr_table(suvr: &BTreeMap<String, amypet::suvr::SuvrValues>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Reference", "VOI", "SUVr"]);
    for (reference, values) in suvr {
        for (name, v) in &values.values {
            table.add_row(vec![reference.clone(), name.clone(), format!("{:.4}", v)]);
        }
    }
    table
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        // --- EXPLORE ---
        Commands::Explore { input, series } => {
            apply_series_args(&mut config, &series);
            let res = explore_input(&input, &explore_options(&config))?;
            println!("{}", series_table(&res));
            let f = res.outpath.join(EXPLORE_FILE);
            write_json(&f, &res)?;
            println!("Report: {}", f.display());
        }

        // --- ALIGN ---
        Commands::Align { input, series, index, force, cost } => {
            apply_series_args(&mut config, &series);
            if let Some(c) = cost {
                config.registration.cost = c;
            }
            let res = explore_input(&input, &explore_options(&config))?;
            let selected = match index {
                Some(i) => res.series.get(i).zip(res.descr.get(i)),
                None => res.first_static_suvr(),
            };
            let Some((s, c)) = selected else {
                return Err(AmyPetError::Classification(format!(
                    "no series to align among the {} found",
                    res.series.len()
                ))
                .into());
            };

            let start = Instant::now();
            let reg = &config.registration;
            let options = AlignOptions {
                outpath: Some(res.outpath.clone()),
                cost: reg.cost,
                force: force || config.force_align,
                fwhm: reg.align_fwhm,
                registration: reg.params(reg.align_fwhm, reg.align_fwhm, false),
            };
            let aligned = align_suvr(s, &c.frames, &options, progress_printer())?;
            println!(
                "Aligned {} frame(s) of '{}' to frame {} in {:.2?}",
                c.frames.len(),
                s.description,
                aligned.reference,
                start.elapsed()
            );
            println!("Output: {}", aligned.fpet.display());
        }

        // --- STATIC ---
        Commands::Static { pet, frames, output, fname, no_com } => {
            let options = StaticOptions {
                frames: (!frames.is_empty()).then_some(frames),
                outpath: output.or(config.output.clone()),
                fname,
                com_correction: config.com_correction && !no_com,
                dcm2niix: Dcm2niix::new(config.dcm2niix.clone()),
                ..Default::default()
            };
            let res = preproc_suvr(&pet, &options)?;
            println!("Static image ({} frame(s)): {}", res.frames.len(), res.fstat.display());
            if let Some(f) = &res.fcom {
                println!("Centre-of-mass corrected: {}", f.display());
            }
        }

        // --- VOIS ---
        Commands::Vois { pet, labels, mask, masks_out, json } => {
            let pet_img = read_nifti_file(&pet)?;
            let lbl_img = read_nifti_file(&labels)?;
            let mask_img = mask.as_deref().map(read_nifti_file).transpose()?;
            let defs = match &config.vois {
                Some(v) => v.clone(),
                None => default_definitions(&lbl_img),
            };
            let options = VoiOptions { outpath: masks_out, ..Default::default() };
            let vois = extract_vois(&pet_img, &lbl_img, &defs, mask_img.as_ref(), &options)?;
            println!("{}", voi_table(&vois));
            if let Some(f) = json {
                write_json(&f, &vois)?;
                println!("Report: {}", f.display());
            }
        }

        // --- SUVR ---
        Commands::Suvr { pet, t1w, labels, frames, output } => {
            let start = Instant::now();
            let mut options = suvr_options(&config, output.or(config.output.clone()));
            options.frames = (!frames.is_empty()).then_some(frames);
            let res = voi_process(&pet, &labels, &t1w, &options)?;
            println!("{}", suvr_table(&res.suvr));
            if let Some(f) = &res.fqc {
                println!("QC: {}", f.display());
            }
            println!("Finished in {:.2?}", start.elapsed());
        }

        // --- CENTILOID ---
        Commands::Centiloid { suvr, tracer, anchors } => {
            let cl = match (anchors.as_deref(), tracer.or(config.tracer)) {
                (Some([yc, ad]), _) => Calibration::from_anchors(*yc, *ad)?.apply(suvr),
                (_, Some(t)) => centiloid(t, suvr),
                _ => {
                    return Err(AmyPetError::Config(
                        "either a tracer or the two anchor SUVr values are required".into(),
                    )
                    .into())
                }
            };
            println!("SUVr {:.4} = {:.1} CL", suvr, cl);
        }

        // --- FULL PIPELINE ---
        Commands::Run { input, t1w, labels, series } => {
            apply_series_args(&mut config, &series);
            let start = Instant::now();
            let report = run_pipeline(&input, &t1w, &labels, &config, progress_printer())?;
            println!("{}", suvr_table(&report.suvr.suvr));
            match &report.centiloid {
                Some(cl) => println!("Centiloid ({}): {:.1} CL (SUVr {:.4})", cl.tracer, cl.centiloid, cl.suvr),
                None => println!("Centiloid not computed"),
            }
            println!("Pipeline finished in {:.2?}, outputs in {}", start.elapsed(), report.outpath.display());
        }
    }

    Ok(())
}
