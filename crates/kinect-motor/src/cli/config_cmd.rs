//! `config` subcommand: show current configuration and file paths, or
//! write a default config file.

use super::{Config, ConfigOutput, Context, MotorError, Result, kv, kv_indent, kv_width, print_json};

/// Write the default settings to `--config` or the platform path.
pub(super) fn cmd_config_init(ctx: &Context, force: bool) -> Result<()> {
    let path = ctx
        .config_path
        .clone()
        .or_else(Config::path)
        .ok_or_else(|| MotorError::Config("no config directory".into()))?;
    if path.exists() && !force {
        return Err(MotorError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }

    let defaults = Config::default();
    match &ctx.config_path {
        Some(custom) => defaults.save_to(custom)?,
        None => defaults.save()?,
    }
    log::info!("wrote default config to {}", path.display());

    if ctx.json {
        return print_json(&ConfigOutput {
            config_file: Some(path.display().to_string()),
            config_file_exists: true,
            log_level: defaults.log_level().to_string(),
            settings: defaults,
            problems: Vec::new(),
        });
    }
    println!("Wrote default config to {}", path.display());
    Ok(())
}

pub(super) fn cmd_config(ctx: &Context) -> Result<()> {
    let config = &ctx.config;
    let config_path = ctx.config_path.clone().or_else(Config::path);
    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let problems: Vec<String> = match config.validate() {
        Ok(()) => Vec::new(),
        Err(errors) => errors.iter().map(|e| e.to_string()).collect(),
    };

    if ctx.json {
        return print_json(&ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            log_level: config.log_level().to_string(),
            settings: config.clone(),
            problems,
        });
    }

    let w = kv_width(
        &["Config file:", "Log level:"],
        &[
            "debug_level:",
            "debug_trace:",
            "feedback:",
            "exclusive_open:",
            "init_timeout_ms:",
            "hotplug_interval_ms:",
            "device_serial:",
        ],
    );

    match &config_path {
        Some(p) if config_exists => kv("Config file:", format_args!("{} (loaded)", p.display()), w),
        Some(p) => kv(
            "Config file:",
            format_args!("{} (not found, using defaults)", p.display()),
            w,
        ),
        None => kv("Config file:", "(no config directory)", w),
    }
    kv("Log level:", config.log_level(), w);
    println!();

    println!("Settings:");
    kv_indent("debug_level:", format_args!("0x{:02x}", config.debug_level), w);
    kv_indent("debug_trace:", config.debug_trace, w);
    kv_indent("feedback:", config.feedback, w);
    kv_indent("exclusive_open:", config.exclusive_open, w);
    kv_indent("init_timeout_ms:", config.init_timeout_ms, w);
    kv_indent("hotplug_interval_ms:", config.hotplug_interval_ms, w);
    let serial = if config.device_serial.is_empty() {
        "(first found)"
    } else {
        config.device_serial.as_str()
    };
    kv_indent("device_serial:", serial, w);

    if !problems.is_empty() {
        println!();
        println!("Problems:");
        for p in &problems {
            println!("  {p}");
        }
    }
    Ok(())
}
