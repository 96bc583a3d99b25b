//! Transfers a byte pattern between two engines over a simulated link and reports the result.
//!
//! Call example:
//!
//! * `inet-loop -n 1000000 -l 4096 --drop-every 50 --mtu 1000 -vv`
use inet_loop::config;

fn main() {
    let config = config::Config::from_args();
    inet_loop::init_logger(config.verbose);

    println!("[+] Transferring {} bytes", config.bytes);
    match inet_loop::run(&config) {
        Ok(score) => {
            println!("[+] Done\n");
            println!("{}", score);
        },
        Err(err) => {
            eprintln!("[-] {}", err);
            std::process::exit(1);
        },
    }
}
