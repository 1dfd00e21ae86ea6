/*! Support for downloading data from a data commons.

Each function takes an object id, a [`commons::Resolve`] implementation to find out where the
object's bytes live, and a destination for the data.  The download itself is a plain GET of the
presigned URL, retried according to a [`commons::Retry`] configuration; 4xx responses are not
retried.

## Convenience Functions

Most uses of this crate can utilize one of the following convenience functions:

* [download_to_buf] -- download data to a fixed-size buffer;
* [download_to_vec] -- download data to a dynamically allocated buffer;
* [download_to_file] -- download data to a [tokio::fs::File]; or
* [download_to_dir] -- download data into a directory, under the object's own name.

## Existing Files

[download_to_dir] looks before it writes.  With [`DownloadOptions::skip_completed`], a complete
local copy is skipped and a partial one is resumed with a range request.  With
[`DownloadOptions::rename_existing`], an existing file is kept and the download is written as
`name (N).ext`.  The [`DownloadOutcome`] reports which of these happened.

## Factories

A download may be retried, in which case the download function must have a means to truncate the
data destination and begin writing again.  This is accomplished with the
[`AsyncWriterFactory`](crate::AsyncWriterFactory) trait, which defines a `get_writer` method to
generate a fresh [tokio::io::AsyncWrite] for each attempt.  Users for whom the supplied
convenience functions are inadequate can add their own implementation of this trait.

 */
mod factory;
mod geturl;
mod local;
mod object;

#[cfg(test)]
mod test_helpers;

pub use factory::{AsyncWriterFactory, CursorWriterFactory, FileWriterFactory};
pub use geturl::Fetched;
pub use local::{download_to_dir, Disposition, DownloadOptions, DownloadOutcome};
pub use object::{
    download_to_buf, download_to_file, download_to_vec, download_url_with_factory,
    download_with_factory,
};
