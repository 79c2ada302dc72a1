#[macro_use]
extern crate log;

use std::env;
use std::error::Error;
use std::fs::OpenOptions;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process;

use structopt::StructOpt;

use index::{IndexError, WordIndex};

#[derive(StructOpt, Debug)]
enum Opt {
    /// Creates a backing file; the file's length becomes the region size
    #[structopt(name = "init")]
    Init {
        /// Length of the backing file, in bytes
        #[structopt(short = "s", long = "size", default_value = "67108864")]
        size: u64,
        #[structopt(parse(from_os_str))]
        path: PathBuf
    },
    /// Reads lines from stdin and indexes every whitespace separated word
    #[structopt(name = "shell")]
    Shell {
        /// Discard whatever the backing file currently holds
        #[structopt(long = "truncate")]
        truncate: bool,
        #[structopt(parse(from_os_str))]
        path: PathBuf
    },
    /// Prints how many times each given word was indexed
    #[structopt(name = "count")]
    Count {
        #[structopt(parse(from_os_str))]
        path: PathBuf,
        #[structopt(required = true)]
        words: Vec< String >
    },
    /// Removes the given words from the index
    #[structopt(name = "remove")]
    Remove {
        #[structopt(parse(from_os_str))]
        path: PathBuf,
        #[structopt(required = true)]
        words: Vec< String >
    },
    /// Prints every indexed word with its count, in ascending order
    #[structopt(name = "dump")]
    Dump {
        #[structopt(parse(from_os_str))]
        path: PathBuf
    },
    /// Prints summary statistics about the index and its region
    #[structopt(name = "stats")]
    Stats {
        #[structopt(parse(from_os_str))]
        path: PathBuf
    }
}

fn print_stats( index: &WordIndex ) {
    println!( "{} words, {} unique", index.items(), index.unique() );
    println!( "{} bytes of region space used, {} remaining", index.space_utilized(), index.space_capacity() );
}

fn run( opt: Opt ) -> Result< (), Box< dyn Error > > {
    match opt {
        Opt::Init { size, path } => {
            let fp = OpenOptions::new().write( true ).create_new( true ).open( &path )?;
            fp.set_len( size )?;

            // Write out an empty index so the first non-truncating open
            // finds a valid region header.
            let index = WordIndex::open( &path, true )?;
            index.close()?;

            info!( "Created {:?} with a {} byte region", path, size );
        },
        Opt::Shell { truncate, path } => {
            let mut index = WordIndex::open( &path, truncate )?;

            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = line?;
                for word in line.split_whitespace() {
                    index.insert( word )?;
                }
            }

            print_stats( &index );
            index.close()?;
        },
        Opt::Count { path, words } => {
            let index = WordIndex::open( &path, false )?;
            for word in &words {
                println!( "{} {}", index.count( word ), word );
            }
            index.close()?;
        },
        Opt::Remove { path, words } => {
            let mut index = WordIndex::open( &path, false )?;
            for word in &words {
                match index.remove( word ) {
                    Ok( () ) => println!( "removed {}", word ),
                    Err( IndexError::NotFound ) => println!( "{} is not in the index", word ),
                    Err( error ) => return Err( error.into() ),
                }
            }
            index.close()?;
        },
        Opt::Dump { path } => {
            let index = WordIndex::open( &path, false )?;
            index.for_each( |word, count| {
                println!( "{:>8} {}", count, word );
            });
            index.close()?;
        },
        Opt::Stats { path } => {
            let index = WordIndex::open( &path, false )?;
            print_stats( &index );
            index.close()?;
        },
    }

    Ok(())
}

fn main() {
    if env::var( "RUST_LOG" ).is_err() {
        env::set_var( "RUST_LOG", "info" );
    }

    env_logger::init();

    let opt = Opt::from_args();
    let result = run( opt );
    if let Err( error ) = result {
        error!( "{}", error );
        if !log_enabled!( log::Level::Error ) {
            println!( "ERROR: {}", error );
        }

        process::exit( 1 );
    }
}
