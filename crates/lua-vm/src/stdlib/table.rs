use lua_core::number::format_number;

use super::library;
use crate::error::LuaError;
use crate::ops::CompareOp;
use crate::table::LuaTable;
use crate::thread::Thread;
use crate::value::LuaValue;

pub(super) fn module() -> LuaTable {
    library(&[
        ("insert", insert),
        ("remove", remove),
        ("concat", concat),
        ("unpack", unpack),
        ("pack", pack),
        ("sort", sort),
    ])
}

fn insert(t: &mut Thread) -> Result<usize, LuaError> {
    let list = t.table(1)?;
    let end = list.len() as i64 + 1;
    match t.count() {
        2 => list.set_int(end, t.arg(2)),
        3 => {
            let pos = t.integer(2)?;
            if !(1..=end).contains(&pos) {
                return Err(t.arg_error(2, "position out of bounds"));
            }
            list.insert(pos as usize, t.arg(3));
        }
        _ => return Err(LuaError::msg("wrong number of arguments to 'insert'")),
    }
    Ok(0)
}

fn remove(t: &mut Thread) -> Result<usize, LuaError> {
    let list = t.table(1)?;
    let size = list.len() as i64;
    let pos = t.opt_integer(2, size)?;
    if pos != size && !(1..=size + 1).contains(&pos) {
        return Err(t.arg_error(2, "position out of bounds"));
    }
    let removed = list.remove(pos as usize);
    t.push(removed);
    Ok(1)
}

fn concat(t: &mut Thread) -> Result<usize, LuaError> {
    let list = t.table(1)?;
    let sep = t.opt_string(2)?.unwrap_or_else(|| "".into());
    let i = t.opt_integer(3, 1)?;
    let j = t.opt_integer(4, list.len() as i64)?;
    let mut out = String::new();
    let mut k = i;
    while k <= j {
        match list.get_int(k) {
            LuaValue::LuaString(s) => out.push_str(&s),
            LuaValue::Number(n) => out.push_str(&format_number(n)),
            _ => {
                return Err(LuaError::msg(format!(
                    "invalid value (at index {k}) in table for 'concat'"
                )))
            }
        }
        if k < j {
            out.push_str(&sep);
        }
        k += 1;
    }
    t.push(out);
    Ok(1)
}

/// `unpack(list [, i [, j]])`, shared with the base library.
pub(super) fn unpack(t: &mut Thread) -> Result<usize, LuaError> {
    let list = t.table(1)?;
    let i = t.opt_integer(2, 1)?;
    let j = t.opt_integer(3, list.len() as i64)?;
    if i > j {
        return Ok(0);
    }
    let n = j as i128 - i as i128 + 1;
    if n >= t.config().max_stack_slots as i128 {
        return Err(LuaError::msg("too many results to unpack"));
    }
    Ok(t.ret((i..=j).map(|k| list.get_int(k))))
}

fn pack(t: &mut Thread) -> Result<usize, LuaError> {
    let n = t.count();
    let packed = LuaTable::from_values(t.args());
    packed.set_field("n", n);
    t.push(packed);
    Ok(1)
}

fn sort(t: &mut Thread) -> Result<usize, LuaError> {
    let list = t.table(1)?;
    let comp = match t.arg(2) {
        LuaValue::Nil => None,
        f @ LuaValue::Function(_) => Some(f),
        _ => return Err(t.type_error(2, "function")),
    };
    let items: Vec<LuaValue> = (1..=list.len() as i64).map(|i| list.get_int(i)).collect();
    let mut less = |a: &LuaValue, b: &LuaValue| -> Result<bool, LuaError> {
        match &comp {
            Some(f) => Ok(t.call1(f.clone(), [a.clone(), b.clone()])?.is_truthy()),
            None => t.compare(CompareOp::Lt, a, b),
        }
    };
    let sorted = merge_sort(items, &mut less)?;
    list.set_list(1, sorted);
    Ok(0)
}

/// Stable merge sort with a fallible ordering, so a comparator error aborts
/// the sort and leaves the table untouched.
fn merge_sort<F>(mut items: Vec<LuaValue>, less: &mut F) -> Result<Vec<LuaValue>, LuaError>
where
    F: FnMut(&LuaValue, &LuaValue) -> Result<bool, LuaError>,
{
    if items.len() < 2 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, less)?;
    let right = merge_sort(right, less)?;

    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(a), Some(b)) = (left.peek(), right.peek()) {
        if less(b, a)? {
            out.extend(right.next());
        } else {
            out.extend(left.next());
        }
    }
    out.extend(left);
    out.extend(right);
    Ok(out)
}
