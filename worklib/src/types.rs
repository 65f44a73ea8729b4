use bytes::Bytes;

pub type JobId = String;
pub type ReceiptHandle = String;
pub type BucketName = String;
pub type ObjectBlob = Bytes;
