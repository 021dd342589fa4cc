use nom::branch::alt;
use nom::bytes::complete::{tag, take_till1};
use nom::character::complete::{char, hex_digit1, i32 as parse_i32, i64 as parse_i64, space0, space1};
use nom::character::complete::{u32 as parse_u32, u64 as parse_u64};
use nom::combinator::{all_consuming, map, map_res, opt, rest, verify};
use nom::multi::separated_list1;
use nom::sequence::{preceded, separated_pair, terminated, tuple};
use nom::IResult;

use crate::parser::trace_record::TraceRecord;
use crate::source::{
    AllocatedClass, AllocationData, AllocationMethod, AllocationStack, JniReferenceEvent, JniReferenceEventKind,
    ThreadDescriptor,
};

/// Parses one trace file line, `None` for blank lines and `#` comments.
pub fn parse_trace_line(line: &str) -> Result<Option<TraceRecord>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    match all_consuming(terminated(parse_record, space0))(line) {
        Ok((_, record)) => Ok(Some(record)),
        Err(e) => Err(format!("{:?}", e)),
    }
}

pub fn parse_record(input: &str) -> IResult<&str, TraceRecord> {
    alt((
        parse_class,
        parse_method,
        parse_stack,
        parse_thread,
        parse_alloc,
        parse_free,
        parse_jni_create,
        parse_jni_delete,
    ))(input)
}

fn field<'a, O, F>(parser: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    preceded(space1, parser)
}

/// `-` stands for an absent value, negative numbers are values.
fn optional<'a, O, F>(parser: F) -> impl FnMut(&'a str) -> IResult<&'a str, Option<O>>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    alt((map(parser, Some), map(char('-'), |_| None)))
}

fn word(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace())(input)
}

fn address(input: &str) -> IResult<&str, u64> {
    alt((
        map_res(preceded(tag("0x"), hex_digit1), |hex| u64::from_str_radix(hex, 16)),
        parse_u64,
    ))(input)
}

fn parse_class(input: &str) -> IResult<&str, TraceRecord> {
    let (rest, (_, timestamp, class_id, super_class_id, class_name)) = tuple((
        tag("class"),
        field(parse_i64),
        field(parse_i64),
        field(optional(parse_i64)),
        field(word),
    ))(input)?;
    let class = AllocatedClass {
        class_id,
        super_class_id,
        class_name: class_name.to_string(),
    };
    Ok((rest, TraceRecord::Class { timestamp, class }))
}

fn parse_method(input: &str) -> IResult<&str, TraceRecord> {
    let (rest, (_, timestamp, method_id, class_name, method_name)) = tuple((
        tag("method"),
        field(parse_i64),
        field(parse_u64),
        field(word),
        field(word),
    ))(input)?;
    let method = AllocationMethod {
        method_id,
        method_name: method_name.to_string(),
        class_name: class_name.to_string(),
    };
    Ok((rest, TraceRecord::Method { timestamp, method }))
}

fn parse_stack(input: &str) -> IResult<&str, TraceRecord> {
    let frame = separated_pair(parse_u64, char(':'), parse_i32);
    let (rest, (_, timestamp, stack_id, frames)) = tuple((
        tag("stack"),
        field(parse_i64),
        field(parse_u64),
        field(separated_list1(char(','), frame)),
    ))(input)?;
    let stack = AllocationStack { stack_id, frames };
    Ok((rest, TraceRecord::Stack { timestamp, stack }))
}

fn parse_thread(input: &str) -> IResult<&str, TraceRecord> {
    // thread names may contain spaces
    let (rest, (_, timestamp, thread_id, name)) = tuple((
        tag("thread"),
        field(parse_i64),
        field(parse_u32),
        field(verify(map(rest, str::trim), |name: &str| !name.is_empty())),
    ))(input)?;
    let thread = ThreadDescriptor {
        thread_id,
        name: name.to_string(),
    };
    Ok((rest, TraceRecord::Thread { timestamp, thread }))
}

fn parse_alloc(input: &str) -> IResult<&str, TraceRecord> {
    let (rest, (_, timestamp, tag_value, class_tag, size, length, heap_id, thread_id, stack_id)) = tuple((
        tag("alloc"),
        field(parse_i64),
        field(parse_u64),
        field(parse_i64),
        field(parse_i64),
        field(parse_i32),
        field(parse_i32),
        field(optional(parse_u32)),
        field(optional(parse_u64)),
    ))(input)?;
    let data = AllocationData {
        tag: tag_value,
        class_tag,
        size,
        length,
        heap_id,
        thread_id,
        stack_id,
    };
    Ok((rest, TraceRecord::Alloc { timestamp, data }))
}

fn parse_free(input: &str) -> IResult<&str, TraceRecord> {
    let (rest, (_, timestamp, tag_value)) = tuple((tag("free"), field(parse_i64), field(parse_u64)))(input)?;
    Ok((
        rest,
        TraceRecord::Free {
            timestamp,
            tag: tag_value,
        },
    ))
}

fn parse_jni_create(input: &str) -> IResult<&str, TraceRecord> {
    let (rest, (_, timestamp, tag_value, ref_value, thread_id, backtrace)) = tuple((
        tag("jni+"),
        field(parse_i64),
        field(parse_u64),
        field(address),
        field(optional(parse_u32)),
        opt(field(separated_list1(char(','), address))),
    ))(input)?;
    let event = JniReferenceEvent {
        kind: JniReferenceEventKind::Create,
        timestamp,
        tag: tag_value,
        ref_value,
        thread_id,
        backtrace: backtrace.map(Into::into),
    };
    Ok((rest, TraceRecord::Jni(event)))
}

fn parse_jni_delete(input: &str) -> IResult<&str, TraceRecord> {
    let (rest, (_, timestamp, tag_value, ref_value, thread_id)) = tuple((
        tag("jni-"),
        field(parse_i64),
        field(parse_u64),
        field(address),
        field(optional(parse_u32)),
    ))(input)?;
    let event = JniReferenceEvent {
        kind: JniReferenceEventKind::Delete,
        timestamp,
        tag: tag_value,
        ref_value,
        thread_id,
        backtrace: None,
    };
    Ok((rest, TraceRecord::Jni(event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::trace_record::RecordTag;

    #[test]
    fn skips_blank_and_comments() {
        assert_eq!(parse_trace_line("   "), Ok(None));
        assert_eq!(parse_trace_line("# class 0 1 - a.B"), Ok(None));
    }

    #[test]
    fn class_line() {
        let record = parse_trace_line("class 10 7 - Lcom/foo/Bar;").unwrap().unwrap();
        assert_eq!(
            record,
            TraceRecord::Class {
                timestamp: 10,
                class: AllocatedClass {
                    class_id: 7,
                    super_class_id: None,
                    class_name: "Lcom/foo/Bar;".to_string(),
                }
            }
        );
        let record = parse_trace_line("class 10 8 7 com.foo.Baz").unwrap().unwrap();
        assert!(matches!(record, TraceRecord::Class { class, .. } if class.super_class_id == Some(7)));
        // negative super ids mark a root class
        let record = parse_trace_line("class 0 2 -1 a.B").unwrap().unwrap();
        assert!(matches!(record, TraceRecord::Class { class, .. } if class.super_class_id == Some(-1)));
        assert!(parse_trace_line("class 0 2 -x a.B").is_err());
    }

    #[test]
    fn stack_and_thread_lines() {
        let record = parse_trace_line("stack 3 100 10:4,11:-1").unwrap().unwrap();
        assert_eq!(
            record,
            TraceRecord::Stack {
                timestamp: 3,
                stack: AllocationStack {
                    stack_id: 100,
                    frames: vec![(10, 4), (11, -1)],
                }
            }
        );
        let record = parse_trace_line("thread 3 2 RenderThread pool-1").unwrap().unwrap();
        assert!(matches!(record, TraceRecord::Thread { thread, .. } if thread.name == "RenderThread pool-1"));
        assert!(parse_trace_line("thread 3 2").is_err());
    }

    #[test]
    fn alloc_and_free_lines() {
        let record = parse_trace_line("alloc 1000 5 7 16 -1 3 2 100").unwrap().unwrap();
        assert_eq!(
            record,
            TraceRecord::Alloc {
                timestamp: 1000,
                data: AllocationData {
                    tag: 5,
                    class_tag: 7,
                    size: 16,
                    length: -1,
                    heap_id: 3,
                    thread_id: Some(2),
                    stack_id: Some(100),
                }
            }
        );
        let record = parse_trace_line("alloc 1000 6 7 16 4 0 - -").unwrap().unwrap();
        assert!(matches!(record, TraceRecord::Alloc { data, .. } if data.thread_id.is_none() && data.stack_id.is_none()));
        assert_eq!(
            parse_trace_line("free 1200 5").unwrap(),
            Some(TraceRecord::Free {
                timestamp: 1200,
                tag: 5
            })
        );
    }

    #[test]
    fn jni_lines() {
        let record = parse_trace_line("jni+ 50 5 0x7f01 2 0x10,0x20").unwrap().unwrap();
        assert_eq!(record.tag(), RecordTag::JniCreate);
        match record {
            TraceRecord::Jni(event) => {
                assert_eq!(event.ref_value, 0x7f01);
                assert_eq!(event.backtrace.as_deref(), Some(&[0x10, 0x20][..]));
            }
            other => panic!("unexpected record {:?}", other),
        }
        let record = parse_trace_line("jni- 60 5 32513 -").unwrap().unwrap();
        assert_eq!(record.tag(), RecordTag::JniDelete);
        assert_eq!(record.timestamp(), 60);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_trace_line("alloc 1000 5").is_err());
        assert!(parse_trace_line("collect 1 2").is_err());
        assert!(parse_trace_line("free 10 5 extra").is_err());
    }
}
