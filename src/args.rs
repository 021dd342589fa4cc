use clap::{crate_authors, crate_description, crate_name, crate_version};
use clap::{Arg, ArgAction, Command};

use crate::capture::{heap_id_by_name, HeapId};
use crate::classifier::strategy::ClassGrouping;
use crate::errors::HeapSiftError;
use crate::errors::HeapSiftError::*;

fn app() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .about(crate_description!())
        .arg(
            Arg::new("inputFile")
                .help("allocation trace input file")
                .long("inputFile")
                .short('i')
                .num_args(1)
                .required(true),
        )
        .arg(
            Arg::new("start")
                .help("window start in microseconds")
                .long("start")
                .short('s')
                .num_args(1)
                .default_value("0")
                .required(false),
        )
        .arg(
            Arg::new("end")
                .help("window end in microseconds, defaults to the end of the trace")
                .long("end")
                .short('e')
                .num_args(1)
                .required(false),
        )
        .arg(
            Arg::new("groupBy")
                .help("arrangement of the instances: class, package, callstack or thread")
                .long("groupBy")
                .short('g')
                .num_args(1)
                .default_value("class")
                .required(false),
        )
        .arg(
            Arg::new("filter")
                .help("only show the sets whose name contains this text")
                .long("filter")
                .short('f')
                .num_args(1)
                .required(false),
        )
        .arg(
            Arg::new("regex")
                .help("interpret the filter as a regular expression")
                .long("regex")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("matchCase")
                .help("case sensitive filter")
                .long("matchCase")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("depth")
                .help("number of tree levels to display")
                .long("depth")
                .short('d')
                .num_args(1)
                .default_value("3")
                .required(false),
        )
        .arg(
            Arg::new("heap")
                .help("only display this heap (default, image, zygote, app or JNI)")
                .long("heap")
                .num_args(1)
                .required(false),
        )
        .arg(
            Arg::new("jni")
                .help("track JNI global references in their own heap")
                .long("jni")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("debug")
                .help("debug info")
                .long("debug")
                .action(ArgAction::SetTrue),
        )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub file_path: String,
    pub start_us: i64,
    pub end_us: Option<i64>,
    pub grouping: ClassGrouping,
    pub filter: Option<String>,
    pub regex: bool,
    pub match_case: bool,
    pub depth: usize,
    pub heap: Option<HeapId>,
    pub track_jni: bool,
    pub debug: bool,
}

pub fn get_args() -> Result<Args, HeapSiftError> {
    parse_args(app().get_matches())
}

fn parse_number<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str) -> Result<Option<T>, HeapSiftError> {
    match matches.get_one::<String>(name) {
        None => Ok(None),
        Some(value) => value.trim().parse::<T>().map(Some).map_err(|_| InvalidArgument {
            name: name.to_string(),
            message: format!("`{}` is not a valid number", value),
        }),
    }
}

fn parse_args(matches: clap::ArgMatches) -> Result<Args, HeapSiftError> {
    let file_path = matches
        .get_one::<String>("inputFile")
        .ok_or_else(|| InvalidArgument {
            name: "inputFile".to_string(),
            message: "missing input file".to_string(),
        })?
        .trim()
        .to_string();

    let start_us = parse_number::<i64>(&matches, "start")?.unwrap_or_default();
    let end_us = parse_number::<i64>(&matches, "end")?;
    if let Some(end_us) = end_us {
        if end_us < start_us {
            return Err(InvalidArgument {
                name: "end".to_string(),
                message: format!("window end {} is before its start {}", end_us, start_us),
            });
        }
    }

    let grouping = match matches.get_one::<String>("groupBy") {
        None => ClassGrouping::default(),
        Some(name) => ClassGrouping::from_name(name).ok_or_else(|| InvalidArgument {
            name: "groupBy".to_string(),
            message: format!("unknown arrangement `{}`", name),
        })?,
    };

    let heap = match matches.get_one::<String>("heap") {
        None => None,
        Some(name) => Some(heap_id_by_name(name).ok_or_else(|| InvalidArgument {
            name: "heap".to_string(),
            message: format!("unknown heap `{}`", name),
        })?),
    };

    Ok(Args {
        file_path,
        start_us,
        end_us,
        grouping,
        filter: matches.get_one::<String>("filter").cloned(),
        regex: matches.get_flag("regex"),
        match_case: matches.get_flag("matchCase"),
        depth: parse_number::<usize>(&matches, "depth")?.unwrap_or(3),
        heap,
        track_jni: matches.get_flag("jni"),
        debug: matches.get_flag("debug"),
    })
}
