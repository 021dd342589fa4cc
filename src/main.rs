use heap_sift::args::get_args;
use heap_sift::errors::HeapSiftError;

fn main() {
    std::process::exit(match main_result() {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("error: {}", err);
            1
        }
    });
}

fn main_result() -> Result<(), HeapSiftError> {
    let args = get_args()?;
    let mut logger = env_logger::Builder::from_default_env();
    if args.debug {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();
    heap_sift::run(args)
}
