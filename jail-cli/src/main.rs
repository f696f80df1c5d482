//! A thin wrapper binary exposing `jail::Jail::execute`/`evaluate` from the
//! command line, for manual exercising and as a host-integration example.
//!

#[macro_use]
extern crate error_chain;
extern crate clap;
extern crate env_logger;
extern crate jail;
extern crate jail_proxy;
extern crate log;
extern crate serde_json;

use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use error_chain::ChainedError;

use jail::{ConfigProvider, EvaluateExtras, Jail, JobRequest, StaticConfig};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Jail(::jail::Error, ::jail::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
    }
}

fn get_arg_matches() -> clap::ArgMatches<'static> {
    clap::App::new("jail-cli")
        .version("0.1.0")
        .about("Run a command or evaluate an expression inside the jail executor")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .arg(
            clap::Arg::with_name("config")
                .long("config")
                .required(true)
                .takes_value(true)
                .value_name("CONFIG_YAML")
                .help("path to the YAML configuration file"),
        )
        .arg(
            clap::Arg::with_name("proxy_helper")
                .long("proxy-helper")
                .takes_value(true)
                .value_name("PROXY_HELPER_BIN")
                .help("path to the jail-proxy-helper binary; enables proxy dispatch when set"),
        )
        .subcommand(
            clap::SubCommand::with_name("run")
                .about("Run a command against a source file")
                .arg(
                    clap::Arg::with_name("command")
                        .short("c")
                        .long("command")
                        .required(true)
                        .takes_value(true)
                        .value_name("COMMAND")
                        .help("logical command name registered in the configuration"),
                )
                .arg(
                    clap::Arg::with_name("context")
                        .long("context")
                        .takes_value(true)
                        .value_name("CONTEXT_KEY")
                        .help("overrides-context key used to resolve effective limits"),
                )
                .arg(
                    clap::Arg::with_name("slug")
                        .long("slug")
                        .takes_value(true)
                        .value_name("SLUG")
                        .help("opaque tag correlating this call in log lines"),
                )
                .arg(
                    clap::Arg::with_name("code")
                        .required(true)
                        .takes_value(true)
                        .value_name("SOURCE_FILE")
                        .help("path to the source file to run"),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("eval")
                .about("Evaluate an expression, passing globals in as JSON")
                .arg(
                    clap::Arg::with_name("command")
                        .short("c")
                        .long("command")
                        .required(true)
                        .takes_value(true)
                        .value_name("COMMAND")
                        .help("logical command name registered in the configuration"),
                )
                .arg(
                    clap::Arg::with_name("context")
                        .long("context")
                        .takes_value(true)
                        .value_name("CONTEXT_KEY")
                        .help("overrides-context key used to resolve effective limits"),
                )
                .arg(
                    clap::Arg::with_name("slug")
                        .long("slug")
                        .takes_value(true)
                        .value_name("SLUG")
                        .help("opaque tag correlating this call in log lines"),
                )
                .arg(
                    clap::Arg::with_name("globals")
                        .long("globals")
                        .takes_value(true)
                        .value_name("GLOBALS_JSON_FILE")
                        .help("path to a JSON object of globals to seed the evaluation with"),
                )
                .arg(
                    clap::Arg::with_name("code")
                        .required(true)
                        .takes_value(true)
                        .value_name("SOURCE_FILE")
                        .help("path to the source file whose contents are evaluated"),
                ),
        )
        .get_matches()
}

fn load_jail(matches: &clap::ArgMatches<'_>) -> Result<Jail> {
    let config_path = PathBuf::from_str(matches.value_of("config").unwrap()).unwrap();
    let yaml = std::fs::read_to_string(&config_path)?;
    let config: Arc<dyn ConfigProvider> = Arc::new(StaticConfig::from_yaml(&yaml)?);

    Ok(match matches.value_of("proxy_helper") {
        Some(helper_path) => {
            let channel = jail_proxy::ProxyChannel::new(helper_path, log::max_level());
            Jail::with_proxy(config, Arc::new(channel))
        }
        None => Jail::new(config),
    })
}

fn do_run(jail: &Jail, matches: &clap::ArgMatches<'_>) -> Result<()> {
    let code_path = matches.value_of("code").unwrap();
    let code = std::fs::read(code_path)?;

    let mut request = JobRequest::new(matches.value_of("command").unwrap());
    request.code = Some(code);
    request.context_key = matches.value_of("context").map(str::to_owned);
    request.slug = matches.value_of("slug").map(str::to_owned);

    let result = jail.execute(request)?;

    std::io::Write::write_all(&mut std::io::stdout(), &result.stdout)?;
    std::io::Write::write_all(&mut std::io::stderr(), &result.stderr)?;
    std::process::exit(if result.status >= 0 { result.status } else { 1 });
}

fn do_eval(jail: &Jail, matches: &clap::ArgMatches<'_>) -> Result<()> {
    let code_path = matches.value_of("code").unwrap();
    let code = std::fs::read_to_string(code_path)?;

    let globals_in = match matches.value_of("globals") {
        Some(path) => {
            let mut content = String::new();
            std::fs::File::open(path)?.read_to_string(&mut content)?;
            serde_json::from_str(&content)?
        }
        None => serde_json::Map::new(),
    };

    let globals_out = jail.evaluate(
        matches.value_of("command").unwrap(),
        &code,
        &globals_in,
        &EvaluateExtras::default(),
        matches.value_of("context").map(str::to_owned),
        matches.value_of("slug").map(str::to_owned),
    )?;

    println!("{}", serde_json::to_string_pretty(&globals_out)?);
    Ok(())
}

fn do_main() -> Result<()> {
    let matches = get_arg_matches();
    let jail = load_jail(&matches)?;

    match matches.subcommand() {
        ("run", Some(run_matches)) => do_run(&jail, run_matches),
        ("eval", Some(eval_matches)) => do_eval(&jail, eval_matches),
        _ => unreachable!(),
    }
}

fn main() {
    env_logger::init();

    if let Err(e) = do_main() {
        eprintln!("{}", e.display_chain());
        std::process::exit(1);
    }
}
