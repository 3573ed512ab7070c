//! Tiny operator tool: print the current 6-digit code for a base32 TOTP
//! secret. Handy for testing invites without an authenticator app.

use std::process::ExitCode;

use besedka_server::auth::totp;

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let (Some(secret), None) = (args.next(), args.next()) else {
        eprintln!("Usage: totp <secret>");
        return ExitCode::FAILURE;
    };

    match totp::generate_at(&secret, chrono::Utc::now().timestamp()) {
        Some(code) => {
            println!("{code:06}");
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("Error generating TOTP: invalid base32 secret");
            ExitCode::FAILURE
        }
    }
}
