use std::fs;

use crate::compile::{resolve_config, validate, RouteTable};
use crate::db::Db;
use crate::diag::Diagnostics;
use crate::eval::Runtime;
use crate::http;

const USAGE: &str = "usage: cascade [options] <file>

options:
  -p, --port <n>   override the configured port
  -h, --host <s>   override the configured host
  --check          parse and validate, then exit
  --dump-ast       print the parsed program as JSON, then exit
  -v, --version    print the version
  --help           print this help";

pub fn run<I>(args: I) -> i32
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut port_override: Option<u16> = None;
    let mut host_override: Option<String> = None;
    let mut check = false;
    let mut dump_ast = false;
    let mut path: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-p" | "--port" => {
                let value = args.next().and_then(|raw| raw.parse::<u16>().ok());
                match value {
                    Some(port) => port_override = Some(port),
                    None => {
                        eprintln!("--port expects a number");
                        eprintln!("{USAGE}");
                        return 1;
                    }
                }
            }
            "-h" | "--host" => match args.next() {
                Some(host) => host_override = Some(host),
                None => {
                    eprintln!("--host expects a value");
                    eprintln!("{USAGE}");
                    return 1;
                }
            },
            "-v" | "--version" => {
                println!("cascade {}", env!("CARGO_PKG_VERSION"));
                return 0;
            }
            "--help" => {
                println!("{USAGE}");
                return 0;
            }
            "--check" => check = true,
            "--dump-ast" => dump_ast = true,
            _ => {
                if path.is_none() {
                    path = Some(arg);
                } else {
                    eprintln!("unexpected argument: {arg}");
                    eprintln!("{USAGE}");
                    return 1;
                }
            }
        }
    }

    let path = match path {
        Some(path) => path,
        None => {
            eprintln!("{USAGE}");
            return 1;
        }
    };
    let src = match fs::read_to_string(&path) {
        Ok(src) => src,
        Err(err) => {
            eprintln!("failed to read {path}: {err}");
            return 1;
        }
    };

    let (program, mut parse_diags) = crate::parse_source(&src);
    let mut diags = Diagnostics::default();
    validate(&program, &mut diags);
    let mut config = resolve_config(&program, &mut diags);
    let table = RouteTable::build(&program, &mut diags);
    parse_diags.extend(diags.into_vec());
    let mut failed = false;
    for diag in &parse_diags {
        eprintln!("{}", diag.render(&src));
        failed |= matches!(diag.level, crate::diag::Level::Error);
    }
    if failed {
        return 1;
    }

    if dump_ast {
        match serde_json::to_string_pretty(&program) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("failed to serialize program: {err}");
                return 1;
            }
        }
        return 0;
    }
    if check {
        return 0;
    }

    if let Some(port) = port_override {
        config.port = port;
    }
    if let Some(host) = host_override {
        config.host = host;
    }

    let db = match &config.database {
        Some(path) => match Db::open(path) {
            Ok(db) => {
                db.reserve_statements(crate::compile::sql_template_count(&program));
                Some(db)
            }
            Err(err) => {
                eprintln!("{err}");
                return 2;
            }
        },
        None => None,
    };
    if let (Some(db), Some(schema)) = (&db, &program.schema) {
        if let Err(err) = db.bootstrap(&schema.sql) {
            eprintln!("{err}");
            return 2;
        }
    }

    let runtime = Runtime::new(db);
    if let Err(err) = http::serve(&program, &table, &config, &runtime) {
        eprintln!("{err}");
        return 3;
    }
    0
}
