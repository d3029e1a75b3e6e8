use std::io::{self, BufRead, Write};

use fcache::client::{Client, ClientError};

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    let mut host = "127.0.0.1".to_string();
    let mut port = 3333u16;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--host" | "-h" => {
                if i + 1 < args.len() {
                    host = args[i + 1].clone();
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    if let Ok(p) = args[i + 1].parse() {
                        port = p;
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    let addr = format!("{host}:{port}");
    let mut client = Client::connect(&addr).await?;
    eprintln!("Connected to {addr}");

    let stdin = io::stdin();
    let mut reader = stdin.lock();

    loop {
        print!("fcache> ");
        io::stdout().flush()?;

        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break; // EOF
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let result = match tokens.as_slice() {
            [] => continue,
            ["quit"] | ["exit"] => break,
            ["get", key] => client.get(key).await.map(Some),
            ["delete", key] => client.delete(key).await.map(|_| None),
            ["set", key, value] => client.set(key, value, 0).await.map(|_| None),
            ["set", key, value, secs] => match secs.parse() {
                Ok(secs) => client.set(key, value, secs).await.map(|_| None),
                Err(_) => {
                    println!("(error) expire must be an integer number of seconds");
                    continue;
                }
            },
            _ => {
                println!("(error) usage: get <key> | set <key> <value> [secs] | delete <key> | quit");
                continue;
            }
        };

        match result {
            Ok(Some(value)) => println!("\"{value}\""),
            Ok(None) => println!("ok"),
            Err(ClientError::Server(msg)) => println!("(error) {msg}"),
            Err(e) => {
                eprintln!("Connection lost: {e}");
                return Err(e);
            }
        }
    }

    Ok(())
}
