use clap::Parser;

fn main() {
    let args = treeder::cli::Args::parse();
    treeder::tracing_setup::init_tracing();

    if let Err(err) = treeder::run(args) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}
