use anyhow::Result;
use std::path::Path;
use std::process::Command;
use usdbfetch_core::config::Config;

pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    println!("usdbfetch dependency check\n");

    let mut all_ok = true;

    print!("yt-dlp:   ");
    match config.yt_dlp_path() {
        Ok(path) => match Command::new(&path).arg("--version").output() {
            Ok(out) if out.status.success() => {
                println!("OK ({}, {})", String::from_utf8_lossy(&out.stdout).trim(), path.display());
            }
            _ => {
                println!("FOUND at {} but failed to get version", path.display());
                all_ok = false;
            }
        },
        Err(_) => {
            println!("NOT FOUND");
            println!("          Install yt-dlp or set paths.yt_dlp");
            all_ok = false;
        }
    }

    print!("ffmpeg:   ");
    let encoder = &config.paths.encoder;
    if encoder.exists() {
        match Command::new(encoder).arg("-version").output() {
            Ok(out) if out.status.success() => {
                let first_line = String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .next()
                    .unwrap_or("")
                    .to_string();
                let version = first_line.split_whitespace().nth(2).unwrap_or("unknown");
                println!("OK ({}, {})", version, encoder.display());
            }
            _ => {
                println!("FOUND at {} but failed to run", encoder.display());
                all_ok = false;
            }
        }
    } else {
        println!("NOT INSTALLED at {}", encoder.display());
        println!("          Run: usdbfetch setup (or it is fetched on first song)");
        if let Ok(system) = which::which("ffmpeg") {
            println!("          A system ffmpeg exists at {}; set paths.encoder to use it", system.display());
        }
    }

    print!("output:   ");
    let output = &config.paths.output;
    if output.is_dir() {
        let songs = std::fs::read_dir(output).map(|d| d.count()).unwrap_or(0);
        println!("{} ({} song folders)", output.display(), songs);
    } else {
        println!("{} (created on first song)", output.display());
    }

    println!();
    if all_ok {
        println!("All dependencies OK!");
    } else {
        println!("Some dependencies are missing. See above for installation instructions.");
    }

    Ok(())
}
