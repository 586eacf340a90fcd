use std::net::{Ipv4Addr, SocketAddrV4};

use clap::{App, Arg};

use socksd::error::Result;
use socksd::server::Server;
#[cfg(target_family = "unix")]
use socksd::util::set_rlimit_nofile;

fn main() -> Result<()> {
    env_logger::init();

    let matches = App::new("socksd")
        .version("0.2.0")
        .about("A single-threaded SOCKS5 proxy server")
        .arg(
            Arg::with_name("port")
                .value_name("PORT")
                .help("Specify the listen port")
                .required(true)
                .index(1),
        )
        .get_matches();

    let port = matches
        .value_of("port")
        .unwrap()
        .parse::<u16>()
        .map_err(|_| "Invalid port!")?;

    #[cfg(target_family = "unix")]
    let _ = set_rlimit_nofile(4096);

    let mut server = Server::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))?;
    server.run()
}
