use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use ringdht::config::ClientArgs;
use ringdht::dht::store::CHUNK_SIZE;
use ringdht::dht::transport::{GrpcTransport, Transport};
use ringdht::error::Result;
use ringdht::hash;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = ClientArgs::parse();
    let transport = Arc::new(GrpcTransport::new());

    println!("Enter DHT query (Get, Set, Delete or Owner).\n  Type exit to quit.");

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            return Ok(());
        }

        let words = input.trim().splitn(3, ' ').collect::<Vec<&str>>();
        let operation = words[0].to_uppercase();

        match &operation[..] {
            "SET" => {
                if words.len() < 3 {
                    println!("You must provide key and value for SET query.");
                    continue;
                }
                let key = hash::ring_id(words[1], args.bits)?;
                let chunks = words[2]
                    .as_bytes()
                    .chunks(CHUNK_SIZE)
                    .map(<[u8]>::to_vec)
                    .collect();
                match transport.save_stream(&args.node, key, chunks).await {
                    Ok(()) => println!("Inserted ({}, {}) as key #{}", words[1], words[2], key),
                    Err(err) => println!("Error: {}", err),
                }
            }
            "DELETE" => {
                if words.len() < 2 {
                    println!("You must provide a key for DELETE query.");
                    continue;
                }
                let key = hash::ring_id(words[1], args.bits)?;
                match transport.delete(&args.node, key).await {
                    Ok(()) => println!("Deleted key #{}", key),
                    Err(err) => println!("Error: {}", err),
                }
            }
            "GET" => {
                if words.len() < 2 {
                    println!("You must provide a key for GET query.");
                    continue;
                }
                let key = hash::ring_id(words[1], args.bits)?;
                let mut results = transport.query_stream(&args.node, key);
                let mut value = Vec::new();
                let mut found = false;
                let mut failed = false;
                while let Some(result) = results.recv().await {
                    match result {
                        Ok(result) => {
                            if let Some(data) = result.data {
                                found = true;
                                value.extend(data);
                            }
                        }
                        Err(err) => {
                            println!("Error: {}", err);
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    continue;
                }
                if found {
                    println!("Value is: {}", String::from_utf8_lossy(&value));
                } else {
                    println!("Key not present");
                }
            }
            "OWNER" => {
                if words.len() < 2 {
                    println!("You must provide a key for OWNER query.");
                    continue;
                }
                let key = hash::ring_id(words[1], args.bits)?;
                match transport.owner(&args.node, key, 0).await {
                    Ok(owner) => println!("Key #{} belongs to {}", key, owner),
                    Err(err) => println!("Error: {}", err),
                }
            }
            "EXIT" => return Ok(()),
            "" => {}
            _ => println!("invalid entry"),
        };
    }
}
